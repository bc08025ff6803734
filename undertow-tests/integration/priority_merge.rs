//! Priorities requested by overlapping readers.

use std::sync::Arc;
use std::thread;

use undertow_core::streaming::PriorityPlan;
use undertow_core::{CancellationToken, ContentHandle, PiecePriority, PieceIndex};

use crate::fixtures::{Fixture, movie_content};

const PIECES: u32 = 32;

fn cancelled() -> CancellationToken {
    let cancel = CancellationToken::new();
    cancel.cancel();
    cancel
}

/// Opens 32 KiB of content with the given pieces held back by the swarm.
fn open_withholding(fixture: &Fixture, withheld: impl IntoIterator<Item = u32>) -> ContentHandle {
    let created = movie_content(PIECES as usize);
    let info_hash = created.description.info_hash;
    for piece in withheld {
        fixture
            .factory
            .faults()
            .withhold_piece(info_hash, PieceIndex::new(piece));
    }
    fixture.open(&fixture.seed(created), false)
}

fn expected_plan(fixture: &Fixture, handle: &ContentHandle, reads: &[(u64, u64)]) -> PriorityPlan {
    let mut merged = PriorityPlan::default();
    for &(offset, length) in reads {
        let plan = PriorityPlan::for_range(
            handle.description(),
            0,
            offset,
            length,
            &fixture.registry.config().scheduler,
        );
        for (piece, tier) in plan.iter() {
            merged.raise(piece, tier);
        }
    }
    merged
}

#[test]
fn test_cancelled_reads_still_prioritize() {
    let fixture = Fixture::with_small_windows();
    let handle = open_withholding(&fixture, 10..=12);

    let mut buf = [0u8; 1024];
    let first = handle.read(0, 10 * 1024, &mut buf, &cancelled());
    let second = handle.read(0, 12 * 1024, &mut buf, &cancelled());
    assert!(first.unwrap_err().is_cancelled());
    assert!(second.unwrap_err().is_cancelled());

    assert_eq!(handle.piece_priority(PieceIndex::new(10)), PiecePriority::Critical);
    assert_eq!(handle.piece_priority(PieceIndex::new(11)), PiecePriority::High);
    assert_eq!(handle.piece_priority(PieceIndex::new(12)), PiecePriority::Critical);
}

#[test]
fn test_later_read_never_lowers_priority() {
    let fixture = Fixture::with_small_windows();
    let handle = open_withholding(&fixture, 0..PIECES);
    let mut buf = [0u8; 1024];

    let _ = handle.read(0, 10 * 1024, &mut buf, &cancelled());
    // Piece 10 falls in this read's look-ahead window only.
    let _ = handle.read(0, 8 * 1024, &mut buf, &cancelled());

    assert_eq!(handle.piece_priority(PieceIndex::new(10)), PiecePriority::Critical);
    assert_eq!(handle.piece_priority(PieceIndex::new(8)), PiecePriority::Critical);
    assert_eq!(handle.piece_priority(PieceIndex::new(9)), PiecePriority::High);
    assert_eq!(handle.piece_priority(PieceIndex::new(20)), PiecePriority::Idle);
}

#[test]
fn test_concurrent_readers_merge_to_maximum() {
    let fixture = Fixture::with_small_windows();
    let handle = open_withholding(&fixture, 0..PIECES);
    let reads: Vec<(u64, u64)> = vec![
        (0, 512),
        (3 * 1024 + 100, 2048),
        (9 * 1024, 1024),
        (15 * 1024 + 1000, 50),
        (24 * 1024, 6000),
        (31 * 1024, 4096),
    ];

    let barrier = Arc::new(std::sync::Barrier::new(reads.len()));
    let workers: Vec<_> = reads
        .iter()
        .map(|&(offset, length)| {
            let handle = handle.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut buf = vec![0u8; length as usize];
                barrier.wait();
                handle
                    .read(0, offset as i64, &mut buf, &cancelled())
                    .unwrap_err()
            })
        })
        .collect();
    for worker in workers {
        assert!(worker.join().unwrap().is_cancelled());
    }

    let expected = expected_plan(&fixture, &handle, &reads);
    for piece in (0..PIECES).map(PieceIndex::new) {
        assert_eq!(
            handle.piece_priority(piece),
            expected.tier(piece),
            "piece {piece}"
        );
    }
}

#[test]
fn test_priorities_rise_as_reader_advances() {
    let fixture = Fixture::with_small_windows();
    let handle = open_withholding(&fixture, [4]);

    let mut buf = [0u8; 1024];
    let read = handle
        .read(0, 2 * 1024, &mut buf, &CancellationToken::new())
        .unwrap();
    assert_eq!(read, 1024);
    assert!(handle.have_piece(PieceIndex::new(2)));
    assert_eq!(handle.piece_priority(PieceIndex::new(4)), PiecePriority::Normal);

    let _ = handle.read(0, 4 * 1024, &mut buf, &cancelled());
    assert_eq!(handle.piece_priority(PieceIndex::new(4)), PiecePriority::Critical);
}
