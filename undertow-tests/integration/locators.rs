//! Opening content from magnet links and description files.

use undertow_core::{
    CancellationToken, ContentDescription, ContentHandle, ContentSource, UndertowError,
};

use crate::fixtures::{FLAG_SIZES, Fixture, file_bytes, flags_content, read_all};

fn open_locator(fixture: &Fixture, locator: &str) -> Result<ContentHandle, UndertowError> {
    fixture.registry.open(
        ContentSource::locator(locator),
        &fixture.save_path(),
        false,
        &CancellationToken::new(),
    )
}

#[test]
fn test_magnet_resolves_seeded_content() {
    let fixture = Fixture::new();
    let created = flags_content();
    let info_hash = created.description.info_hash;
    fixture.seed(created.clone());

    let locator = format!("magnet:?xt=urn:btih:{info_hash}&dn=flags");
    let handle = open_locator(&fixture, &locator).unwrap();

    assert_eq!(handle.info_hash(), info_hash);
    assert_eq!(handle.name(), "flags");
    assert_eq!(read_all(&handle, 1, 300), file_bytes(&created, 1));
}

#[test]
fn test_uppercase_magnet_matches_description() {
    let fixture = Fixture::new();
    let created = flags_content();
    let torrent_bytes = fixture.seed(created.clone());
    let by_description = fixture.open(&torrent_bytes, false);

    let locator = format!(
        "magnet:?xt=urn:btih:{}",
        created.description.info_hash.to_string().to_uppercase()
    );
    let by_magnet = open_locator(&fixture, &locator).unwrap();

    assert!(by_magnet.same_content(&by_description));
    assert_eq!(fixture.factory.stats().torrents_added(), 1);
}

#[test]
fn test_description_file_locator() {
    let fixture = Fixture::new();
    let torrent_bytes = fixture.seed(flags_content());
    let path = fixture.dir.path().join("flags.torrent");
    std::fs::write(&path, &torrent_bytes).unwrap();

    let handle = open_locator(&fixture, path.to_str().unwrap()).unwrap();

    let sizes: Vec<u64> = handle.list_files().into_iter().map(|(_, size)| size).collect();
    assert_eq!(sizes, FLAG_SIZES);
    assert_eq!(handle.find_file("flags/sweden.png").unwrap(), (2, 636));
    let err = handle.find_file("flags/iceland.png").unwrap_err();
    assert!(matches!(err, UndertowError::PathNotFound { ref path } if path == "flags/iceland.png"));
    assert!(err.is_user_error());
}

#[test]
fn test_magnet_embedded_in_path() {
    let fixture = Fixture::new();
    let created = flags_content();
    let info_hash = created.description.info_hash;
    fixture.seed(created);

    let locator = format!("/media/downloads/magnet:?xt=urn:btih:{info_hash}&dn=flags");
    let handle = open_locator(&fixture, &locator).unwrap();

    assert_eq!(handle.info_hash(), info_hash);
}

#[test]
fn test_missing_description_file() {
    let fixture = Fixture::new();
    let path = fixture.dir.path().join("missing.torrent");

    let err = open_locator(&fixture, path.to_str().unwrap()).unwrap_err();
    assert!(matches!(err, UndertowError::Io(_)));
}

#[test]
fn test_fetch_description_caches_magnet_metadata() {
    let fixture = Fixture::new();
    let created = flags_content();
    let info_hash = created.description.info_hash;
    fixture.seed(created);
    let locator = format!("magnet:?xt=urn:btih:{info_hash}");
    let cancel = CancellationToken::new();

    let fetched = fixture.registry.fetch_description(&locator, &cancel).unwrap();
    assert_eq!(ContentDescription::parse(&fetched).unwrap().info_hash, info_hash);
    assert!(fixture.registry.cache_path(info_hash).exists());
    assert_eq!(fixture.factory.stats().torrents_added(), 1);
    assert_eq!(fixture.registry.live_count(), 0);

    let cached = fixture.registry.fetch_description(&locator, &cancel).unwrap();
    assert_eq!(cached, fetched);
    assert_eq!(fixture.factory.stats().torrents_added(), 1);
}

#[test]
fn test_written_description_reopens_same_content() {
    let fixture = Fixture::new();
    let handle = fixture.open(&fixture.seed(flags_content()), false);
    let path = fixture.dir.path().join("exported").join("flags.torrent");

    handle.write_description(&path).unwrap();
    let reopened = open_locator(&fixture, path.to_str().unwrap()).unwrap();

    assert!(reopened.same_content(&handle));
    assert_eq!(reopened.list_files(), handle.list_files());
}
