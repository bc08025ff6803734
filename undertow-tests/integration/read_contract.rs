//! Read semantics of open content.

use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use sha1::{Digest, Sha1};
use undertow_core::torrent::ContentCreator;
use undertow_core::{CancellationToken, ContentDescription, PieceIndex, UndertowError};

use crate::fixtures::{
    FLAG_SIZES, Fixture, file_bytes, flags_content, movie_content, patterned, read_all,
};

#[test]
fn test_flags_files_read_to_exact_size() {
    let fixture = Fixture::new();
    let created = flags_content();
    let handle = fixture.open(&fixture.seed(created.clone()), true);

    assert_eq!(
        handle.list_files(),
        vec![
            ("flags/denmark.png".to_string(), 476),
            ("flags/norway.png".to_string(), 744),
            ("flags/sweden.png".to_string(), 636),
        ]
    );

    for (index, size) in FLAG_SIZES.iter().enumerate() {
        let content = read_all(&handle, index, 100);
        assert_eq!(content.len() as u64, *size);
        assert_eq!(content, file_bytes(&created, index));
    }
}

/// Info dictionary of the three-flag description, bencoded by hand.
const FLAGS_INFO: &[u8] = b"d5:filesld6:lengthi476e4:pathl11:denmark.pngeed6:lengthi744e4:pathl10:norway.pngeed6:lengthi636e4:pathl10:sweden.pngeee4:name5:flags12:piece lengthi16384e6:pieces20:AAAAAAAAAAAAAAAAAAAAe";

const FLAGS_IDENTITY: &str = "9fef43b0306d855ce50ad2090337c68ffeb4f299";

fn flags_description_bytes() -> Vec<u8> {
    let mut torrent = b"d8:announce30:udp://tracker.example.org:13377:comment5:flags4:info".to_vec();
    torrent.extend_from_slice(FLAGS_INFO);
    torrent.push(b'e');
    torrent
}

#[test]
fn test_identity_of_known_description() {
    let fixture = Fixture::new();
    let handle = fixture.open(&flags_description_bytes(), false);

    assert_eq!(hex::encode(Sha1::digest(FLAGS_INFO)), FLAGS_IDENTITY);
    assert_eq!(handle.identity_hex(), FLAGS_IDENTITY);
    assert_eq!(handle.name(), "flags");
    let sizes: Vec<u64> = handle.list_files().into_iter().map(|(_, size)| size).collect();
    assert_eq!(sizes, FLAG_SIZES);

    // Re-serializing keeps the identity.
    let reparsed = ContentDescription::parse(&handle.description_bytes()).unwrap();
    assert_eq!(reparsed.info_hash.to_string(), FLAGS_IDENTITY);
}

#[test]
fn test_created_content_identity_is_stable() {
    let fixture = Fixture::new();
    let first = flags_content();
    let second = flags_content();
    let handle = fixture.open(&fixture.seed(first.clone()), true);

    assert_eq!(first.description.info_hash, second.description.info_hash);
    assert_eq!(handle.identity_hex().len(), 40);
    assert!(handle.identity_hex().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[test]
fn test_file_index_out_of_range() {
    let fixture = Fixture::new();
    let handle = fixture.open(&fixture.seed(flags_content()), true);
    let mut buf = [0u8; 32];

    let err = handle
        .read(5, 0, &mut buf, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(
        err,
        UndertowError::FileNotFound {
            index: 5,
            file_count: 3
        }
    ));
    assert!(err.is_user_error());
}

#[test]
fn test_offsets_at_or_past_end_return_zero() {
    let fixture = Fixture::new();
    let handle = fixture.open(&fixture.seed(flags_content()), true);
    let cancel = CancellationToken::new();
    let mut buf = [0u8; 32];

    for (index, size) in FLAG_SIZES.iter().enumerate() {
        assert_eq!(handle.read(index, *size as i64, &mut buf, &cancel).unwrap(), 0);
        assert_eq!(
            handle.read(index, *size as i64 + 4096, &mut buf, &cancel).unwrap(),
            0
        );
    }
}

#[test]
fn test_negative_offset_rejected() {
    let fixture = Fixture::new();
    let handle = fixture.open(&fixture.seed(flags_content()), true);

    let err = handle
        .read(0, -5, &mut [0u8; 8], &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, UndertowError::InvalidOffset { offset: -5 }));
}

#[test]
fn test_single_read_stops_at_piece_boundary() {
    let fixture = Fixture::new();
    let created = flags_content();
    let handle = fixture.open(&fixture.seed(created.clone()), true);

    // norway.png starts at stream offset 476, 36 bytes before piece 1 ends
    let mut buf = [0u8; 400];
    let read = handle
        .read(1, 0, &mut buf, &CancellationToken::new())
        .unwrap();
    assert_eq!(read, 512 - 476);
    assert_eq!(&buf[..read], &file_bytes(&created, 1)[..read]);
}

#[test]
fn test_failed_piece_read_leaves_handle_usable() {
    let fixture = Fixture::new();
    let created = flags_content();
    let info_hash = created.description.info_hash;
    let handle = fixture.open(&fixture.seed(created.clone()), true);
    fixture.factory.faults().fail_reads(info_hash, PieceIndex::new(0));

    let mut buf = [0u8; 64];
    let err = handle
        .read(0, 0, &mut buf, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, UndertowError::PieceReadFailed { .. }));

    fixture.factory.faults().clear();
    let read = handle
        .read(0, 0, &mut buf, &CancellationToken::new())
        .unwrap();
    assert_eq!(&buf[..read], &file_bytes(&created, 0)[..read]);
}

#[test]
fn test_torrent_error_fails_blocked_read() {
    let fixture = Fixture::new();
    let created = movie_content(4);
    let info_hash = created.description.info_hash;
    let handle = fixture.open(&fixture.seed(created.clone()), false);
    fixture.factory.faults().withhold_piece(info_hash, PieceIndex::new(2));

    let blocked = {
        let handle = handle.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 256];
            handle.read(0, 2 * 1024, &mut buf, &CancellationToken::new())
        })
    };
    thread::sleep(Duration::from_millis(50));
    fixture.factory.faults().fail_torrent(info_hash, "storage unplugged");

    match blocked.join().unwrap() {
        Err(UndertowError::PieceReadFailed { piece, reason }) => {
            assert_eq!(piece, PieceIndex::new(2));
            assert_eq!(reason, "storage unplugged");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    fixture.factory.faults().clear();
    // Let errors reported before the clear drain through the pump.
    thread::sleep(Duration::from_millis(100));
    let mut buf = [0u8; 256];
    let read = handle
        .read(0, 2 * 1024, &mut buf, &CancellationToken::new())
        .unwrap();
    assert_eq!(&buf[..read], &file_bytes(&created, 0)[2048..2048 + read]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_sequential_reads_cover_every_file(
        sizes in prop::collection::vec(1usize..2000, 1..4),
        piece_size in prop::sample::select(vec![64u32, 100, 256, 1024]),
        chunk in 1usize..700,
    ) {
        let mut creator = ContentCreator::with_piece_size(piece_size);
        for (index, size) in sizes.iter().enumerate() {
            let name = format!("part{index}.bin");
            creator = creator.add_file(&[name.as_str()], patterned(*size, index as u8));
        }
        let created = creator.build("parts").unwrap();

        let fixture = Fixture::new();
        let handle = fixture.open(&fixture.seed(created.clone()), false);

        for (index, size) in sizes.iter().enumerate() {
            let content = read_all(&handle, index, chunk);
            prop_assert_eq!(content.len(), *size);
            prop_assert_eq!(&content[..], file_bytes(&created, index));
        }
    }
}
