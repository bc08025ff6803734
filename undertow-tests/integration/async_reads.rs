//! Async and `std::io` access to content.

use std::io::{Read, Seek, SeekFrom};

use undertow_core::{CancellationToken, ContentReader, PieceIndex, UndertowError};

use crate::fixtures::{Fixture, file_bytes, flags_content, movie_content};

#[tokio::test(flavor = "multi_thread")]
async fn test_read_async_returns_requested_bytes() {
    let fixture = Fixture::new();
    let created = flags_content();
    let handle = fixture.open(&fixture.seed(created.clone()), false);

    let bytes = handle
        .read_async(2, 10, 100, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(&bytes[..], &file_bytes(&created, 2)[10..10 + bytes.len()]);
    assert!(!bytes.is_empty());

    let past_end = handle
        .read_async(2, 636, 100, CancellationToken::new())
        .await
        .unwrap();
    assert!(past_end.is_empty());

    tokio::task::spawn_blocking(move || drop(handle)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_async_reads() {
    let fixture = Fixture::new();
    let created = movie_content(16);
    let handle = fixture.open(&fixture.seed(created.clone()), false);

    let reads = (0..16).map(|piece| {
        let handle = handle.clone();
        tokio::spawn(async move {
            let bytes = handle
                .read_async(0, piece * 1024, 1024, CancellationToken::new())
                .await;
            tokio::task::spawn_blocking(move || drop(handle)).await.unwrap();
            (piece, bytes)
        })
    });

    for read in reads.collect::<Vec<_>>() {
        let (piece, bytes) = read.await.unwrap();
        let start = piece as usize * 1024;
        assert_eq!(&bytes.unwrap()[..], &file_bytes(&created, 0)[start..start + 1024]);
    }

    tokio::task::spawn_blocking(move || drop(handle)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_read_cancellation() {
    let fixture = Fixture::new();
    let created = movie_content(2);
    let info_hash = created.description.info_hash;
    let handle = fixture.open(&fixture.seed(created), false);
    fixture.factory.faults().withhold_piece(info_hash, PieceIndex::new(1));

    let cancel = CancellationToken::new();
    let pending = tokio::spawn({
        let handle = handle.clone();
        let cancel = cancel.clone();
        async move {
            let result = handle.read_async(0, 1024, 64, cancel).await;
            tokio::task::spawn_blocking(move || drop(handle)).await.unwrap();
            result
        }
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    cancel.cancel();
    assert!(matches!(pending.await.unwrap(), Err(UndertowError::Cancelled)));

    tokio::task::spawn_blocking(move || drop(handle)).await.unwrap();
}

#[test]
fn test_cursor_reads_whole_file() {
    let fixture = Fixture::new();
    let created = flags_content();
    let handle = fixture.open(&fixture.seed(created.clone()), false);

    let mut reader = ContentReader::new(handle, 1, CancellationToken::new()).unwrap();
    let mut content = Vec::new();
    reader.read_to_end(&mut content).unwrap();
    assert_eq!(content, file_bytes(&created, 1));

    reader.seek(SeekFrom::Start(700)).unwrap();
    let mut tail = Vec::new();
    reader.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, &file_bytes(&created, 1)[700..]);

    reader.seek(SeekFrom::End(-44)).unwrap();
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, &file_bytes(&created, 1)[700..704]);
}
