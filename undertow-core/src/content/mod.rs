//! Open content items and their shared lifetime.
//!
//! A [`ContentHandle`] is the caller's reference to one content item inside
//! the engine. Handles are cheap to clone; all clones share the same engine
//! entry. When the last one is dropped the item is removed from the engine,
//! deleting downloaded data unless files are kept.

pub mod registry;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use registry::ContentRegistry;

use crate::engine::{EngineSession, PiecePriority, WaitTarget};
use crate::streaming::piece_reader::{copy_piece_range, read_piece, wait_for_piece};
use crate::streaming::PriorityScheduler;
use crate::torrent::{ContentDescription, InfoHash, PieceIndex};
use crate::UndertowError;

/// What to open: raw description bytes, or a locator resolved to them.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentSource {
    /// Bencoded content description
    Description(Vec<u8>),
    /// Magnet URI, or path to a description file
    Locator(String),
}

impl ContentSource {
    pub fn locator(locator: impl Into<String>) -> Self {
        ContentSource::Locator(locator.into())
    }
}

impl From<Vec<u8>> for ContentSource {
    fn from(bytes: Vec<u8>) -> Self {
        ContentSource::Description(bytes)
    }
}

/// Lifecycle of one content item.
///
/// `Created -> MetadataPending -> MetadataReady -> RemovalRequested ->
/// Removed`, with `MetadataPending -> Failed` when the engine reports an
/// error before metadata arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentState {
    Created,
    MetadataPending,
    MetadataReady,
    RemovalRequested,
    Removed,
    Failed,
}

impl fmt::Display for ContentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContentState::Created => "created",
            ContentState::MetadataPending => "metadata-pending",
            ContentState::MetadataReady => "metadata-ready",
            ContentState::RemovalRequested => "removal-requested",
            ContentState::Removed => "removed",
            ContentState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-identity registry slot. Creation and teardown of one identity both
/// run under its lock.
pub(crate) type ContentSlot = Mutex<Weak<ContentInner>>;

pub(crate) struct ContentInner {
    description: Arc<ContentDescription>,
    session: Arc<EngineSession>,
    scheduler: PriorityScheduler,
    keep_files: bool,
    removal_timeout: Duration,
    state: Mutex<ContentState>,
    handles: AtomicUsize,
}

impl ContentInner {
    pub(crate) fn new(
        description: Arc<ContentDescription>,
        session: Arc<EngineSession>,
        scheduler: PriorityScheduler,
        keep_files: bool,
        removal_timeout: Duration,
    ) -> Self {
        Self {
            description,
            session,
            scheduler,
            keep_files,
            removal_timeout,
            state: Mutex::new(ContentState::MetadataReady),
            handles: AtomicUsize::new(0),
        }
    }

    fn info_hash(&self) -> InfoHash {
        self.description.info_hash
    }

    fn set_state(&self, state: ContentState) {
        let mut current = self.state.lock();
        debug!(info_hash = %self.info_hash(), from = %*current, to = %state, "Content state change");
        *current = state;
    }

    /// Removes the item from the engine and waits for confirmation.
    fn tear_down(&self) {
        self.set_state(ContentState::RemovalRequested);
        let confirmed = remove_from_engine(
            &self.session,
            self.info_hash(),
            !self.keep_files,
            self.removal_timeout,
        );
        if confirmed {
            self.set_state(ContentState::Removed);
        }
    }
}

/// Requests removal and blocks up to `timeout` for the engine to confirm.
///
/// Removal is best effort: a refusal or a missing confirmation is logged and
/// reported as `false`, never as an error.
pub(crate) fn remove_from_engine(
    session: &Arc<EngineSession>,
    info_hash: InfoHash,
    delete_files: bool,
    timeout: Duration,
) -> bool {
    let pending = session.begin_wait(WaitTarget::Removed(info_hash));
    if let Err(e) = session.engine().remove_torrent(info_hash, delete_files) {
        warn!(%info_hash, error = %e, "Engine refused removal");
        return false;
    }

    match pending.wait(&CancellationToken::new(), Some(timeout)) {
        Ok(_) => {
            info!(%info_hash, delete_files, "Content removed");
            true
        }
        Err(e) => {
            warn!(%info_hash, error = %e, "Removal not confirmed, continuing");
            false
        }
    }
}

/// Shared reference to one open content item.
///
/// Dropping the last clone removes the item from the engine. That drop
/// blocks for up to the configured removal timeout, so async hosts should
/// release the final handle off the runtime threads.
pub struct ContentHandle {
    inner: Arc<ContentInner>,
    slot: Arc<ContentSlot>,
}

impl ContentHandle {
    /// Must be called with the slot lock held.
    pub(crate) fn new(inner: Arc<ContentInner>, slot: Arc<ContentSlot>) -> Self {
        inner.handles.fetch_add(1, Ordering::AcqRel);
        Self { inner, slot }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.inner.info_hash()
    }

    /// Lowercase 40-character hex identity.
    pub fn identity_hex(&self) -> String {
        self.info_hash().to_string()
    }

    pub fn name(&self) -> &str {
        &self.inner.description.name
    }

    pub fn description(&self) -> &Arc<ContentDescription> {
        &self.inner.description
    }

    pub fn state(&self) -> ContentState {
        *self.inner.state.lock()
    }

    pub fn keeps_files(&self) -> bool {
        self.inner.keep_files
    }

    /// True when both handles refer to the same engine entry.
    pub fn same_content(&self, other: &ContentHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// `(path, size)` of every file, in stream order.
    pub fn list_files(&self) -> Vec<(String, u64)> {
        self.inner.description.file_entries()
    }

    /// # Errors
    /// - `UndertowError::FileNotFound` - Index out of range
    pub fn file_size(&self, file_index: usize) -> Result<u64, UndertowError> {
        self.inner
            .description
            .file(file_index)
            .map(|file| file.length)
            .ok_or_else(|| self.file_not_found(file_index))
    }

    /// Looks a file up by its listed path.
    ///
    /// # Errors
    /// - `UndertowError::PathNotFound` - No file has this path
    pub fn find_file(&self, path: &str) -> Result<(usize, u64), UndertowError> {
        let description = &self.inner.description;
        description
            .find_file(path)
            .and_then(|index| Some((index, description.file(index)?.length)))
            .ok_or_else(|| UndertowError::PathNotFound {
                path: path.to_string(),
            })
    }

    /// Re-serialized content description.
    pub fn description_bytes(&self) -> Vec<u8> {
        self.inner.description.to_bytes()
    }

    /// Writes the re-serialized description to `path`, creating parent
    /// directories as needed.
    ///
    /// # Errors
    /// - `UndertowError::Io` - Directory or file could not be written
    pub fn write_description(&self, path: &Path) -> Result<(), UndertowError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.description_bytes())?;
        debug!(info_hash = %self.info_hash(), path = %path.display(), "Wrote description");
        Ok(())
    }

    pub fn have_piece(&self, piece: PieceIndex) -> bool {
        self.inner.session.engine().have_piece(self.info_hash(), piece)
    }

    pub fn piece_priority(&self, piece: PieceIndex) -> PiecePriority {
        self.inner
            .session
            .engine()
            .piece_priority(self.info_hash(), piece)
    }

    /// Reads up to `buf.len()` bytes of file `file_index` starting at
    /// `offset`, blocking until they are available locally.
    ///
    /// Each call returns bytes from at most one piece, so a full buffer is
    /// not guaranteed. Zero means end of file.
    ///
    /// # Errors
    /// - `UndertowError::FileNotFound` - File index out of range
    /// - `UndertowError::InvalidOffset` - Negative offset
    /// - `UndertowError::Cancelled` - `cancel` fired while waiting
    /// - `UndertowError::PieceReadFailed` - Piece could not be loaded
    /// - `UndertowError::Engine` - Engine rejected a request
    pub fn read(
        &self,
        file_index: usize,
        offset: i64,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<usize, UndertowError> {
        let description = &self.inner.description;
        let file = description
            .file(file_index)
            .ok_or_else(|| self.file_not_found(file_index))?;
        if offset < 0 {
            return Err(UndertowError::InvalidOffset { offset });
        }

        let offset = offset as u64;
        if offset >= file.length || buf.is_empty() {
            return Ok(0);
        }
        let Some(request) = description.map_file(file_index, offset, buf.len()) else {
            return Ok(0);
        };

        let session = &self.inner.session;
        let info_hash = self.info_hash();
        self.inner.scheduler.schedule(
            session.engine(),
            description,
            file_index,
            offset,
            buf.len() as u64,
        )?;

        wait_for_piece(session, info_hash, request.piece, cancel)?;
        let piece_bytes = read_piece(session, info_hash, request.piece, cancel)?;
        let copied = copy_piece_range(&piece_bytes, &request, buf);

        debug!(
            %info_hash,
            file = file_index,
            offset,
            piece = %request.piece,
            copied,
            "Read complete"
        );
        Ok(copied)
    }

    /// Async variant of [`ContentHandle::read`] that returns the bytes read.
    ///
    /// The blocking read runs on the runtime's blocking pool and keeps its
    /// own handle clone until it finishes.
    ///
    /// # Errors
    /// Same as [`ContentHandle::read`], plus `UndertowError::Io` if the
    /// blocking task panicked.
    pub async fn read_async(
        &self,
        file_index: usize,
        offset: i64,
        length: usize,
        cancel: CancellationToken,
    ) -> Result<Bytes, UndertowError> {
        let handle = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; length];
            let read = handle.read(file_index, offset, &mut buf, &cancel)?;
            buf.truncate(read);
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|e| UndertowError::Io(std::io::Error::other(e)))?
    }

    fn file_not_found(&self, index: usize) -> UndertowError {
        UndertowError::FileNotFound {
            index,
            file_count: self.inner.description.file_count(),
        }
    }
}

impl fmt::Debug for ContentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentHandle")
            .field("info_hash", &self.info_hash())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Clone for ContentHandle {
    fn clone(&self) -> Self {
        self.inner.handles.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(&self.inner),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl Drop for ContentHandle {
    fn drop(&mut self) {
        let mut live = self.slot.lock();
        if self.inner.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            *live = Weak::new();
            self.inner.tear_down();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::thread;

    use super::*;
    use crate::config::UndertowConfig;
    use crate::engine::test_mocks::ScriptedFactory;
    use crate::torrent::{ContentCreator, CreatedContent};

    fn flags() -> CreatedContent {
        ContentCreator::with_piece_size(512)
            .add_file(&["denmark.png"], vec![1u8; 476])
            .add_file(&["norway.png"], vec![2u8; 744])
            .add_file(&["sweden.png"], vec![3u8; 636])
            .build("flags")
            .unwrap()
    }

    fn open(factory: &Arc<ScriptedFactory>, created: &CreatedContent) -> (ContentRegistry, ContentHandle) {
        factory
            .engine
            .register_payload(created.description.info_hash, created.payload.clone());
        let registry = ContentRegistry::new(factory.clone(), UndertowConfig::for_testing());
        let handle = registry
            .open(
                created.torrent_bytes.clone().into(),
                &std::env::temp_dir(),
                true,
                &CancellationToken::new(),
            )
            .unwrap();
        (registry, handle)
    }

    #[test]
    fn test_read_argument_errors() {
        let factory = Arc::new(ScriptedFactory::new());
        let (_registry, handle) = open(&factory, &flags());
        let cancel = CancellationToken::new();
        let mut buf = [0u8; 16];

        assert!(matches!(
            handle.read(5, 0, &mut buf, &cancel),
            Err(UndertowError::FileNotFound { index: 5, file_count: 3 })
        ));
        assert!(matches!(
            handle.read(0, -1, &mut buf, &cancel),
            Err(UndertowError::InvalidOffset { offset: -1 })
        ));
        assert_eq!(handle.read(0, 476, &mut buf, &cancel).unwrap(), 0);
        assert_eq!(handle.read(0, 10_000, &mut buf, &cancel).unwrap(), 0);
        assert_eq!(handle.read(0, 0, &mut [], &cancel).unwrap(), 0);
    }

    #[test]
    fn test_read_waits_for_piece() {
        let factory = Arc::new(ScriptedFactory::new());
        let created = flags();
        let (_registry, handle) = open(&factory, &created);
        let info_hash = handle.info_hash();

        let engine = factory.engine.clone();
        let completer = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(30));
            engine.complete_piece(info_hash, PieceIndex::new(0));
        });

        let mut buf = [0u8; 1024];
        let read = handle
            .read(1, 0, &mut buf, &CancellationToken::new())
            .unwrap();
        completer.join().unwrap();

        // norway.png starts 476 bytes into piece 0
        assert_eq!(read, 512 - 476);
        assert!(buf[..read].iter().all(|&byte| byte == 2));
        assert_eq!(
            handle.piece_priority(PieceIndex::new(1)),
            PiecePriority::Critical
        );
    }

    #[test]
    fn test_metadata_accessors() {
        let factory = Arc::new(ScriptedFactory::new());
        let created = flags();
        let (_registry, handle) = open(&factory, &created);

        assert_eq!(handle.name(), "flags");
        assert_eq!(handle.identity_hex().len(), 40);
        assert_eq!(handle.state(), ContentState::MetadataReady);
        assert_eq!(handle.find_file("flags/norway.png").unwrap(), (1, 744));
        match handle.find_file("flags/finland.png") {
            Err(UndertowError::PathNotFound { path }) => assert_eq!(path, "flags/finland.png"),
            other => panic!("unexpected lookup result: {other:?}"),
        }
        assert_eq!(handle.file_size(2).unwrap(), 636);
        assert_eq!(handle.description_bytes(), created.torrent_bytes);
        assert_eq!(factory.engine.adds.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_write_description_creates_parents() {
        let factory = Arc::new(ScriptedFactory::new());
        let created = flags();
        let (_registry, handle) = open(&factory, &created);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flags.torrent");

        handle.write_description(&path).unwrap();
        let written = std::fs::read(&path).unwrap();
        assert_eq!(
            ContentDescription::parse(&written).unwrap().info_hash,
            handle.info_hash()
        );
    }
}
