//! Deduplicating registry of open content.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ContentHandle, ContentInner, ContentSlot, ContentSource, ContentState, remove_from_engine};
use crate::config::UndertowConfig;
use crate::engine::{AddTorrentParams, EngineFactory, EngineSession, TorrentSource, WaitTarget};
use crate::streaming::PriorityScheduler;
use crate::torrent::{ContentDescription, InfoHash, MagnetParser};
use crate::UndertowError;

/// Maps content identity to the live handle for it.
///
/// At most one engine entry exists per identity. Concurrent opens of the
/// same identity serialize on that identity's slot and converge on one
/// handle; unrelated identities never wait on each other. The engine
/// session is started on first use and stopped once no content references
/// it.
pub struct ContentRegistry {
    factory: Arc<dyn EngineFactory>,
    config: UndertowConfig,
    session: Mutex<Weak<EngineSession>>,
    slots: Mutex<HashMap<InfoHash, Arc<ContentSlot>>>,
}

impl ContentRegistry {
    pub fn new(factory: Arc<dyn EngineFactory>, config: UndertowConfig) -> Self {
        Self {
            factory,
            config,
            session: Mutex::new(Weak::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &UndertowConfig {
        &self.config
    }

    /// Opens content with the configured download directory and keep-files
    /// policy.
    ///
    /// # Errors
    /// Same as [`ContentRegistry::open`].
    pub fn open_default(
        &self,
        source: ContentSource,
        cancel: &CancellationToken,
    ) -> Result<ContentHandle, UndertowError> {
        let save_path = self.config.storage.download_dir.clone();
        self.open(source, &save_path, self.config.storage.keep_files, cancel)
    }

    /// Opens content, blocking until its description is available.
    ///
    /// Returns the existing handle when the identity is already open; the
    /// `keep_files` decision of the first opener then stands.
    ///
    /// # Errors
    /// - `UndertowError::DescriptionParse` - Malformed description or magnet link
    /// - `UndertowError::CreationFailed` - Engine rejected the content or metadata failed
    /// - `UndertowError::Cancelled` - `cancel` fired while waiting for metadata
    /// - `UndertowError::Io` - Description file could not be read
    pub fn open(
        &self,
        source: ContentSource,
        save_path: &Path,
        keep_files: bool,
        cancel: &CancellationToken,
    ) -> Result<ContentHandle, UndertowError> {
        let torrent_source = resolve_source(source)?;
        let info_hash = torrent_source.info_hash();

        self.get_or_create(info_hash, || {
            self.create_content(torrent_source, save_path, keep_files, cancel)
        })
    }

    /// Returns the live handle for `info_hash`, or runs `create` under the
    /// identity's lock and records the result.
    ///
    /// # Errors
    /// Whatever `create` returns; nothing is recorded in that case.
    pub(crate) fn get_or_create<F>(
        &self,
        info_hash: InfoHash,
        create: F,
    ) -> Result<ContentHandle, UndertowError>
    where
        F: FnOnce() -> Result<ContentInner, UndertowError>,
    {
        let slot = {
            let mut slots = self.slots.lock();
            // A slot referenced only by the map has no handles and no opener.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(slots.entry(info_hash).or_default())
        };

        let mut live = slot.lock();
        if let Some(inner) = live.upgrade() {
            debug!(%info_hash, "Reusing open content");
            return Ok(ContentHandle::new(inner, Arc::clone(&slot)));
        }

        let inner = Arc::new(create()?);
        *live = Arc::downgrade(&inner);
        Ok(ContentHandle::new(inner, Arc::clone(&slot)))
    }

    /// Returns description bytes for a locator.
    ///
    /// A description file is read and validated. A magnet link is served from
    /// `<cache_dir>/<hex>.torrent` when present; otherwise the content is
    /// opened, its metadata awaited, and the description cached.
    ///
    /// # Errors
    /// - `UndertowError::DescriptionParse` - Malformed magnet link or description file
    /// - `UndertowError::CreationFailed` - Metadata could not be fetched
    /// - `UndertowError::Cancelled` - `cancel` fired while waiting
    /// - `UndertowError::Io` - File or cache access failed
    pub fn fetch_description(
        &self,
        locator: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, UndertowError> {
        let Some(magnet_uri) = MagnetParser::find_magnet(locator) else {
            let bytes = std::fs::read(locator)?;
            ContentDescription::parse(&bytes)?;
            return Ok(bytes);
        };

        let magnet = MagnetParser::parse_magnet_link(magnet_uri)?;
        let cache_path = self.cache_path(magnet.info_hash);
        if let Some(bytes) = read_cached(&cache_path, magnet.info_hash) {
            debug!(info_hash = %magnet.info_hash, "Description served from cache");
            return Ok(bytes);
        }

        let handle = self.open_default(ContentSource::locator(magnet_uri), cancel)?;
        if let Err(e) = handle.write_description(&cache_path) {
            warn!(info_hash = %magnet.info_hash, error = %e, "Could not cache description");
        }
        Ok(handle.description_bytes())
    }

    /// Location of the cached description for `info_hash`.
    pub fn cache_path(&self, info_hash: InfoHash) -> PathBuf {
        self.config.storage.cache_dir.join(format!("{info_hash}.torrent"))
    }

    /// Number of identities with a live handle.
    pub fn live_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.lock().strong_count() > 0)
            .count()
    }

    /// Whether an engine session is currently running.
    pub fn session_active(&self) -> bool {
        self.session.lock().strong_count() > 0
    }

    /// Current session, starting one if none is alive.
    fn session(&self) -> Result<Arc<EngineSession>, UndertowError> {
        let mut current = self.session.lock();
        if let Some(session) = current.upgrade() {
            return Ok(session);
        }

        let engine = self.factory.create()?;
        let session = EngineSession::start(engine, self.config.engine.poll_interval)?;
        *current = Arc::downgrade(&session);
        info!("Engine session created");
        Ok(session)
    }

    /// Adds the content to the engine and waits for its description.
    ///
    /// On failure the engine entry is removed again, so no partial content
    /// outlives the attempt.
    fn create_content(
        &self,
        source: TorrentSource,
        save_path: &Path,
        keep_files: bool,
        cancel: &CancellationToken,
    ) -> Result<ContentInner, UndertowError> {
        let info_hash = source.info_hash();
        let session = self.session()?;
        let mut state = ContentState::Created;
        debug!(%info_hash, %state, save_path = %save_path.display(), "Creating content");

        let pending = session.begin_wait(WaitTarget::Metadata(info_hash));
        session
            .engine()
            .add_torrent(AddTorrentParams {
                source,
                save_path: save_path.to_path_buf(),
            })
            .map_err(|e| UndertowError::CreationFailed {
                info_hash: info_hash.to_string(),
                reason: e.to_string(),
            })?;

        state = ContentState::MetadataPending;
        debug!(%info_hash, %state, "Waiting for metadata");

        let description = pending.wait(cancel, None).and_then(|_| {
            session
                .engine()
                .description(info_hash)
                .ok_or_else(|| UndertowError::CreationFailed {
                    info_hash: info_hash.to_string(),
                    reason: "Metadata reported without a description".to_string(),
                })
        });

        let description = match description {
            Ok(description) => description,
            Err(e) => {
                state = ContentState::Failed;
                warn!(%info_hash, %state, error = %e, "Content creation failed");
                remove_from_engine(
                    &session,
                    info_hash,
                    !keep_files,
                    self.config.engine.removal_timeout,
                );
                return Err(e);
            }
        };

        info!(
            %info_hash,
            name = %description.name,
            files = description.file_count(),
            pieces = description.piece_count(),
            "Content ready"
        );

        Ok(ContentInner::new(
            description,
            session,
            PriorityScheduler::new(self.config.scheduler.clone()),
            keep_files,
            self.config.engine.removal_timeout,
        ))
    }
}

/// Turns caller input into something the engine can add.
fn resolve_source(source: ContentSource) -> Result<TorrentSource, UndertowError> {
    match source {
        ContentSource::Description(bytes) => {
            let description = ContentDescription::parse(&bytes)?;
            Ok(TorrentSource::Description(Arc::new(description)))
        }
        ContentSource::Locator(locator) => {
            if let Some(magnet_uri) = MagnetParser::find_magnet(&locator) {
                let magnet = MagnetParser::parse_magnet_link(magnet_uri)?;
                return Ok(TorrentSource::Magnet(magnet));
            }
            let bytes = std::fs::read(&locator)?;
            let description = ContentDescription::parse(&bytes)?;
            Ok(TorrentSource::Description(Arc::new(description)))
        }
    }
}

/// Cached description bytes, if present and matching `info_hash`.
fn read_cached(path: &Path, info_hash: InfoHash) -> Option<Vec<u8>> {
    let bytes = std::fs::read(path).ok()?;
    match ContentDescription::parse(&bytes) {
        Ok(description) if description.info_hash == info_hash => Some(bytes),
        Ok(_) | Err(_) => {
            warn!(%info_hash, path = %path.display(), "Ignoring stale cached description");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::thread;

    use super::*;
    use crate::engine::test_mocks::ScriptedFactory;
    use crate::engine::EngineEvent;
    use crate::torrent::ContentCreator;

    fn registry(factory: Arc<ScriptedFactory>) -> ContentRegistry {
        ContentRegistry::new(factory, UndertowConfig::for_testing())
    }

    fn torrent_bytes() -> Vec<u8> {
        ContentCreator::with_piece_size(64)
            .add_file(&["clip.mp4"], vec![5u8; 300])
            .build("clip.mp4")
            .unwrap()
            .torrent_bytes
    }

    #[test]
    fn test_open_same_identity_twice_shares_handle() {
        let factory = Arc::new(ScriptedFactory::new());
        let registry = registry(factory.clone());
        let cancel = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();

        let first = registry
            .open(torrent_bytes().into(), dir.path(), true, &cancel)
            .unwrap();
        let second = registry
            .open(torrent_bytes().into(), dir.path(), false, &cancel)
            .unwrap();

        assert!(first.same_content(&second));
        assert!(second.keeps_files());
        assert_eq!(factory.engine.adds.load(Ordering::SeqCst), 1);
        assert_eq!(registry.live_count(), 1);

        drop(first);
        assert_eq!(factory.engine.removals.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(factory.engine.removals.load(Ordering::SeqCst), 1);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_clone_dropped_on_other_thread_tears_down_once() {
        let factory = Arc::new(ScriptedFactory::new());
        let registry = registry(factory.clone());
        let dir = tempfile::tempdir().unwrap();

        let handle = registry
            .open(torrent_bytes().into(), dir.path(), true, &CancellationToken::new())
            .unwrap();
        let clones: Vec<_> = (0..4).map(|_| handle.clone()).collect();
        drop(handle);

        let threads: Vec<_> = clones
            .into_iter()
            .map(|clone| thread::spawn(move || drop(clone)))
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(factory.engine.removals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reopen_after_release_creates_new_entry() {
        let factory = Arc::new(ScriptedFactory::new());
        let registry = registry(factory.clone());
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        let handle = registry
            .open(torrent_bytes().into(), dir.path(), true, &cancel)
            .unwrap();
        let info_hash = handle.info_hash();
        drop(handle);
        assert!(!factory.engine.contains(info_hash));
        assert!(!registry.session_active());

        let handle = registry
            .open(torrent_bytes().into(), dir.path(), true, &cancel)
            .unwrap();
        assert!(factory.engine.contains(info_hash));
        assert_eq!(factory.engine.adds.load(Ordering::SeqCst), 2);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        drop(handle);
    }

    #[test]
    fn test_malformed_description_is_parse_error() {
        let registry = registry(Arc::new(ScriptedFactory::new()));
        let err = registry
            .open(
                ContentSource::Description(b"not bencode".to_vec()),
                Path::new("/tmp"),
                true,
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, UndertowError::DescriptionParse { .. }));
        assert!(!registry.session_active());
    }

    #[test]
    fn test_metadata_failure_removes_entry() {
        let factory = Arc::new(ScriptedFactory::new());
        let registry = Arc::new(registry(factory.clone()));
        let magnet = "magnet:?xt=urn:btih:18945a9300abfe4ff2442559bb08b8ddb357c16f&dn=flags";
        let info_hash = InfoHash::from_hex("18945a9300abfe4ff2442559bb08b8ddb357c16f").unwrap();

        let engine = factory.engine.clone();
        let failer = thread::spawn(move || {
            while !engine.contains(info_hash) {
                thread::sleep(std::time::Duration::from_millis(5));
            }
            engine.emit(EngineEvent::MetadataFailed {
                info_hash,
                reason: "no peers".to_string(),
            });
        });

        let err = registry
            .open(
                ContentSource::locator(magnet),
                Path::new("/tmp"),
                true,
                &CancellationToken::new(),
            )
            .unwrap_err();
        failer.join().unwrap();

        match err {
            UndertowError::CreationFailed { reason, .. } => assert_eq!(reason, "no peers"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!factory.engine.contains(info_hash));
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_cancelled_open_leaves_nothing_behind() {
        let factory = Arc::new(ScriptedFactory::new());
        let registry = registry(factory.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = registry
            .open(
                ContentSource::locator(
                    "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567",
                ),
                Path::new("/tmp"),
                true,
                &cancel,
            )
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(factory.engine.removals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fetch_description_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = UndertowConfig::for_testing().with_storage_root(dir.path());
        let factory = Arc::new(ScriptedFactory::new());
        let registry = ContentRegistry::new(factory.clone(), config);

        let created = ContentCreator::with_piece_size(64)
            .add_file(&["clip.mp4"], vec![5u8; 300])
            .build("clip.mp4")
            .unwrap();
        let info_hash = created.description.info_hash;
        let cache_path = registry.cache_path(info_hash);
        std::fs::create_dir_all(cache_path.parent().unwrap()).unwrap();
        std::fs::write(&cache_path, &created.torrent_bytes).unwrap();

        let magnet = format!("magnet:?xt=urn:btih:{info_hash}");
        let bytes = registry
            .fetch_description(&magnet, &CancellationToken::new())
            .unwrap();

        assert_eq!(bytes, created.torrent_bytes);
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fetch_description_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.torrent");
        std::fs::write(&path, torrent_bytes()).unwrap();

        let registry = registry(Arc::new(ScriptedFactory::new()));
        let bytes = registry
            .fetch_description(path.to_str().unwrap(), &CancellationToken::new())
            .unwrap();
        assert_eq!(bytes, torrent_bytes());
    }
}
