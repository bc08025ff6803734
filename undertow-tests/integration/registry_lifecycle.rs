//! Deduplication and teardown of shared content.

use std::sync::{Arc, Barrier};
use std::thread;

use undertow_core::{CancellationToken, ContentSource, ContentState, PieceIndex, UndertowError};

use crate::fixtures::{Fixture, flags_content, movie_content, read_all};

#[test]
fn test_concurrent_opens_share_one_item() {
    let fixture = Arc::new(Fixture::new());
    let torrent_bytes = Arc::new(fixture.seed(flags_content()));
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let fixture = Arc::clone(&fixture);
            let torrent_bytes = Arc::clone(&torrent_bytes);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                fixture.open(&torrent_bytes, true)
            })
        })
        .collect();
    let handles: Vec<_> = workers
        .into_iter()
        .map(|worker| worker.join().unwrap())
        .collect();

    assert!(handles.windows(2).all(|pair| pair[0].same_content(&pair[1])));
    assert_eq!(fixture.registry.live_count(), 1);
    assert_eq!(fixture.factory.stats().torrents_added(), 1);
    assert_eq!(fixture.factory.stats().engines_created(), 1);
}

#[test]
fn test_teardown_waits_for_last_handle() {
    let fixture = Fixture::new();
    let torrent_bytes = fixture.seed(flags_content());
    let first = fixture.open(&torrent_bytes, true);
    let second = fixture.open(&torrent_bytes, true);
    let stats = fixture.factory.stats();

    drop(first);
    assert_eq!(stats.torrents_removed(), 0);
    assert_eq!(second.state(), ContentState::MetadataReady);
    assert_eq!(read_all(&second, 0, 128).len(), 476);

    drop(second);
    assert_eq!(stats.torrents_removed(), 1);
    assert_eq!(fixture.registry.live_count(), 0);
    assert!(!fixture.registry.session_active());
    assert!(fixture.factory.current_swarm().is_none());
}

#[test]
fn test_discarding_content_deletes_its_data() {
    let fixture = Fixture::new();
    let handle = fixture.open(&fixture.seed(flags_content()), false);
    read_all(&handle, 2, 256);
    let torrent_dir = fixture.torrent_dir(&handle);
    assert!(torrent_dir.exists());

    drop(handle);
    assert!(!torrent_dir.exists());
}

#[test]
fn test_kept_content_is_reused_on_reopen() {
    let fixture = Fixture::new();
    let torrent_bytes = fixture.seed(movie_content(8));
    let stats = fixture.factory.stats();

    let handle = fixture.open(&torrent_bytes, true);
    let first_pass = read_all(&handle, 0, 1024);
    let torrent_dir = fixture.torrent_dir(&handle);
    drop(handle);
    assert!(torrent_dir.exists());
    let verified = stats.pieces_verified();
    assert_eq!(verified, 8);

    let reopened = fixture.open(&torrent_bytes, true);
    assert!((0..8).all(|piece| reopened.have_piece(PieceIndex::new(piece))));
    assert_eq!(read_all(&reopened, 0, 1024), first_pass);
    assert_eq!(stats.pieces_verified(), verified);
    assert_eq!(stats.engines_created(), 2);
}

#[test]
fn test_first_opener_decides_file_retention() {
    let fixture = Fixture::new();
    let torrent_bytes = fixture.seed(flags_content());

    let keeper = fixture.open(&torrent_bytes, true);
    let discarder = fixture.open(&torrent_bytes, false);
    assert!(keeper.keeps_files());
    assert!(discarder.keeps_files());

    read_all(&keeper, 0, 512);
    let torrent_dir = fixture.torrent_dir(&keeper);
    drop(keeper);
    drop(discarder);
    assert!(torrent_dir.exists());
}

#[test]
fn test_unknown_magnet_fails_and_leaves_nothing_behind() {
    let fixture = Fixture::new();
    let locator = format!("magnet:?xt=urn:btih:{}", "ab".repeat(20));

    let err = fixture
        .registry
        .open(
            ContentSource::locator(locator),
            &fixture.save_path(),
            false,
            &CancellationToken::new(),
        )
        .unwrap_err();

    assert!(matches!(err, UndertowError::CreationFailed { .. }));
    assert_eq!(fixture.registry.live_count(), 0);
    assert!(!fixture.registry.session_active());
}

#[test]
fn test_malformed_description_rejected_before_engine_starts() {
    let fixture = Fixture::new();

    let err = fixture
        .registry
        .open(
            ContentSource::Description(b"d4:infoi3ee".to_vec()),
            &fixture.save_path(),
            false,
            &CancellationToken::new(),
        )
        .unwrap_err();

    assert!(matches!(err, UndertowError::DescriptionParse { .. }));
    assert!(err.is_user_error());
    assert_eq!(fixture.factory.stats().engines_created(), 0);
}
