//! Shared setup for integration tests.

use std::path::PathBuf;
use std::sync::{Arc, Once};

use tempfile::TempDir;
use undertow_core::config::SchedulerConfig;
use undertow_core::torrent::{ContentCreator, CreatedContent};
use undertow_core::tracing_setup::{LogLevel, init_tracing};
use undertow_core::{
    CancellationToken, ContentHandle, ContentRegistry, ContentSource, UndertowConfig,
};
use undertow_sim::{SimulatedSwarmFactory, SwarmConfig};

/// File sizes of the three-flag sample content.
pub const FLAG_SIZES: [u64; 3] = [476, 744, 636];

/// Registry wired to a simulated swarm, with storage in a temp dir.
pub struct Fixture {
    pub registry: Arc<ContentRegistry>,
    pub factory: Arc<SimulatedSwarmFactory>,
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(UndertowConfig::for_testing(), SwarmConfig::default())
    }

    pub fn with(config: UndertowConfig, swarm: SwarmConfig) -> Self {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(SimulatedSwarmFactory::new(swarm));
        let config = config.with_storage_root(dir.path());
        let registry = Arc::new(ContentRegistry::new(factory.clone(), config));
        Self {
            registry,
            factory,
            dir,
        }
    }

    /// Windows of a few pieces so tiers are observable on small content.
    pub fn with_small_windows() -> Self {
        let mut config = UndertowConfig::for_testing();
        config.scheduler = SchedulerConfig {
            margin_floor: 1024,
            margin_per_mille: 0,
            lookahead_floor: 4096,
            lookahead_per_mille: 0,
        };
        Self::with(config, SwarmConfig::default())
    }

    pub fn save_path(&self) -> PathBuf {
        self.registry.config().storage.download_dir.clone()
    }

    /// Makes the content available in the swarm and returns its encoded
    /// description.
    pub fn seed(&self, created: CreatedContent) -> Vec<u8> {
        let torrent_bytes = created.torrent_bytes.clone();
        self.factory.library().add(created);
        torrent_bytes
    }

    pub fn open(&self, torrent_bytes: &[u8], keep_files: bool) -> ContentHandle {
        self.registry
            .open(
                ContentSource::Description(torrent_bytes.to_vec()),
                &self.save_path(),
                keep_files,
                &CancellationToken::new(),
            )
            .unwrap()
    }

    pub fn torrent_dir(&self, handle: &ContentHandle) -> PathBuf {
        self.save_path().join(handle.identity_hex())
    }
}

static LOGGING: Once = Once::new();

/// Console logging at the level named by `UNDERTOW_TEST_LOG`, warn by default.
/// The full trace goes to the system temp dir.
fn init_logging() {
    LOGGING.call_once(|| {
        let level = std::env::var("UNDERTOW_TEST_LOG")
            .ok()
            .and_then(|level| level.parse().ok())
            .unwrap_or(LogLevel::Warn);
        let logs_dir = std::env::temp_dir().join("undertow-test-logs");
        let _ = init_tracing(level, Some(&logs_dir));
    });
}

/// Three small images in one multi-file torrent, with distinct bytes per
/// file so misplaced reads are caught.
pub fn flags_content() -> CreatedContent {
    ContentCreator::with_piece_size(256)
        .add_file(&["denmark.png"], patterned(FLAG_SIZES[0] as usize, 1))
        .add_file(&["norway.png"], patterned(FLAG_SIZES[1] as usize, 2))
        .add_file(&["sweden.png"], patterned(FLAG_SIZES[2] as usize, 3))
        .build("flags")
        .unwrap()
}

/// Single file of `piece_count` pieces of 1 KiB.
pub fn movie_content(piece_count: usize) -> CreatedContent {
    ContentCreator::with_piece_size(1024)
        .add_file(&["movie.mkv"], patterned(piece_count * 1024, 7))
        .build("movie.mkv")
        .unwrap()
}

pub fn patterned(len: usize, salt: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(salt))
        .collect()
}

/// Reads a whole file with repeated calls of `chunk` bytes.
pub fn read_all(handle: &ContentHandle, file_index: usize, chunk: usize) -> Vec<u8> {
    let cancel = CancellationToken::new();
    let mut content = Vec::new();
    let mut buf = vec![0u8; chunk];
    loop {
        let read = handle
            .read(file_index, content.len() as i64, &mut buf, &cancel)
            .unwrap();
        if read == 0 {
            return content;
        }
        content.extend_from_slice(&buf[..read]);
    }
}

/// Payload bytes belonging to file `index` of `created`.
pub fn file_bytes(created: &CreatedContent, index: usize) -> &[u8] {
    let file = &created.description.files[index];
    &created.payload[file.offset as usize..(file.offset + file.length) as usize]
}
