//! Cancelling blocked reads.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use undertow_core::{CancellationToken, ContentReader, PieceIndex, UndertowError};

use crate::fixtures::{Fixture, file_bytes, movie_content};

#[test]
fn test_cancel_unblocks_read_waiting_for_missing_piece() {
    let fixture = Fixture::new();
    let created = movie_content(4);
    let info_hash = created.description.info_hash;
    let handle = fixture.open(&fixture.seed(created.clone()), false);
    fixture.factory.faults().withhold_piece(info_hash, PieceIndex::new(0));

    let cancel = CancellationToken::new();
    let cancelled_at = Arc::new(Mutex::new(None));
    let canceller = {
        let cancel = cancel.clone();
        let cancelled_at = Arc::clone(&cancelled_at);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            *cancelled_at.lock() = Some(Instant::now());
            cancel.cancel();
        })
    };

    let mut buf = [0u8; 512];
    let err = handle.read(0, 0, &mut buf, &cancel).unwrap_err();
    let returned_at = Instant::now();
    canceller.join().unwrap();

    assert!(err.is_cancelled());
    let poll = fixture.registry.config().engine.poll_interval;
    let cancelled_at = cancelled_at.lock().unwrap();
    assert!(returned_at.duration_since(cancelled_at) < poll * 2 + Duration::from_millis(150));

    // The handle stays usable once the piece shows up.
    fixture.factory.faults().release_piece(info_hash, PieceIndex::new(0));
    let read = handle
        .read(0, 0, &mut buf, &CancellationToken::new())
        .unwrap();
    assert_eq!(&buf[..read], &file_bytes(&created, 0)[..read]);
}

#[test]
fn test_cancelled_read_does_not_disturb_other_readers() {
    let fixture = Fixture::new();
    let created = movie_content(4);
    let info_hash = created.description.info_hash;
    let handle = fixture.open(&fixture.seed(created.clone()), false);
    fixture.factory.faults().withhold_piece(info_hash, PieceIndex::new(3));

    let cancel = CancellationToken::new();
    let blocked = {
        let handle = handle.clone();
        let cancel = cancel.clone();
        thread::spawn(move || handle.read(0, 3 * 1024, &mut [0u8; 64], &cancel))
    };

    let mut buf = [0u8; 1024];
    let read = handle
        .read(0, 1024, &mut buf, &CancellationToken::new())
        .unwrap();
    assert_eq!(&buf[..read], &file_bytes(&created, 0)[1024..1024 + read]);

    cancel.cancel();
    assert!(matches!(
        blocked.join().unwrap(),
        Err(UndertowError::Cancelled)
    ));
}

#[test]
fn test_cursor_reports_cancellation() {
    let fixture = Fixture::new();
    let created = movie_content(2);
    let info_hash = created.description.info_hash;
    let handle = fixture.open(&fixture.seed(created), false);
    fixture.factory.faults().withhold_piece(info_hash, PieceIndex::new(1));

    let cancel = CancellationToken::new();
    let mut reader = ContentReader::new(handle, 0, cancel.clone()).unwrap();
    let mut content = vec![0u8; 1024];
    std::io::Read::read_exact(&mut reader, &mut content).unwrap();

    cancel.cancel();
    let err = std::io::Read::read(&mut reader, &mut content).unwrap_err();
    assert!(ContentReader::is_cancellation(&err));
    assert_eq!(reader.position(), 1024);
}
