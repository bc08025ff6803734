//! In-process swarm engine.
//!
//! Pieces "arrive" on a worker thread a few per tick, most urgent first.
//! Among pieces of equal priority the order is shuffled with a seeded
//! ChaCha RNG, so runs are reproducible but never assume sequential
//! completion. Every piece is checked against its SHA-1 hash before it is
//! stored and announced.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use sha1::{Digest, Sha1};
use tracing::{debug, trace, warn};
use undertow_core::engine::{
    AddTorrentParams, EngineError, EngineEvent, PiecePriority, SwarmEngine, TorrentSource,
};
use undertow_core::torrent::{ContentDescription, InfoHash, PieceIndex};

use crate::piece_storage::PieceStorage;
use crate::seed_library::SeedLibrary;

/// Timing and ordering of the simulated swarm.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Worker step interval
    pub tick: Duration,
    /// Pieces completed per torrent per tick
    pub pieces_per_tick: usize,
    /// RNG seed for ordering pieces of equal priority
    pub seed: u64,
    /// Delay before a magnet link's metadata resolves
    pub metadata_delay: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(2),
            pieces_per_tick: 2,
            seed: 42,
            metadata_delay: Duration::from_millis(10),
        }
    }
}

/// Counters shared by every swarm built from one factory.
#[derive(Debug, Default)]
pub struct SwarmStats {
    pub engines_created: AtomicUsize,
    pub torrents_added: AtomicUsize,
    pub torrents_removed: AtomicUsize,
    pub pieces_verified: AtomicUsize,
    pub pieces_rejected: AtomicUsize,
}

impl SwarmStats {
    pub fn engines_created(&self) -> usize {
        self.engines_created.load(Ordering::SeqCst)
    }

    pub fn torrents_added(&self) -> usize {
        self.torrents_added.load(Ordering::SeqCst)
    }

    pub fn torrents_removed(&self) -> usize {
        self.torrents_removed.load(Ordering::SeqCst)
    }

    pub fn pieces_verified(&self) -> usize {
        self.pieces_verified.load(Ordering::SeqCst)
    }
}

/// Failures injected by tests.
#[derive(Debug, Default)]
pub struct FaultPlan {
    withheld: Mutex<HashSet<(InfoHash, PieceIndex)>>,
    failing_reads: Mutex<HashSet<(InfoHash, PieceIndex)>>,
    failing_torrents: Mutex<HashMap<InfoHash, String>>,
}

impl FaultPlan {
    /// Piece never completes until released.
    pub fn withhold_piece(&self, info_hash: InfoHash, piece: PieceIndex) {
        self.withheld.lock().insert((info_hash, piece));
    }

    pub fn release_piece(&self, info_hash: InfoHash, piece: PieceIndex) {
        self.withheld.lock().remove(&(info_hash, piece));
    }

    /// Reads of the piece report a storage failure.
    pub fn fail_reads(&self, info_hash: InfoHash, piece: PieceIndex) {
        self.failing_reads.lock().insert((info_hash, piece));
    }

    /// Every tick reports a torrent error until cleared.
    pub fn fail_torrent(&self, info_hash: InfoHash, reason: &str) {
        self.failing_torrents
            .lock()
            .insert(info_hash, reason.to_string());
    }

    pub fn clear(&self) {
        self.withheld.lock().clear();
        self.failing_reads.lock().clear();
        self.failing_torrents.lock().clear();
    }

    fn is_withheld(&self, info_hash: InfoHash, piece: PieceIndex) -> bool {
        self.withheld.lock().contains(&(info_hash, piece))
    }

    fn read_fails(&self, info_hash: InfoHash, piece: PieceIndex) -> bool {
        self.failing_reads.lock().contains(&(info_hash, piece))
    }

    fn torrent_failure(&self, info_hash: InfoHash) -> Option<String> {
        self.failing_torrents.lock().get(&info_hash).cloned()
    }
}

#[derive(Default)]
struct EventQueue {
    events: Mutex<VecDeque<EngineEvent>>,
    ready: Condvar,
}

impl EventQueue {
    fn push(&self, event: EngineEvent) {
        trace!(?event, "Queued engine event");
        self.events.lock().push_back(event);
        self.ready.notify_all();
    }

    fn drain(&self, timeout: Duration) -> Vec<EngineEvent> {
        let mut events = self.events.lock();
        if events.is_empty() {
            self.ready.wait_for(&mut events, timeout);
        }
        events.drain(..).collect()
    }
}

struct SimTorrent {
    description: Option<Arc<ContentDescription>>,
    storage: PieceStorage,
    have: Vec<bool>,
    priorities: Vec<PiecePriority>,
    metadata_due: Instant,
}

impl SimTorrent {
    fn new(save_path: PathBuf, info_hash: InfoHash, metadata_due: Instant) -> Self {
        Self {
            description: None,
            storage: PieceStorage::new(&save_path, info_hash),
            have: Vec::new(),
            priorities: Vec::new(),
            metadata_due,
        }
    }

    fn attach(&mut self, description: Arc<ContentDescription>) {
        let piece_count = description.piece_count() as usize;
        self.have = (0..piece_count)
            .map(|index| self.storage.has_piece(PieceIndex::new(index as u32)))
            .collect();
        self.priorities = vec![PiecePriority::Idle; piece_count];
        self.description = Some(description);
    }

    fn piece_in_range(&self, piece: PieceIndex) -> bool {
        piece.as_usize() < self.have.len()
    }
}

struct Shared {
    library: Arc<SeedLibrary>,
    faults: Arc<FaultPlan>,
    stats: Arc<SwarmStats>,
    torrents: Mutex<HashMap<InfoHash, SimTorrent>>,
    events: EventQueue,
    shutdown: AtomicBool,
}

/// Swarm engine backed by a [`SeedLibrary`] instead of real peers.
///
/// Nothing downloads while every piece is `Idle`; raising a piece's
/// priority is what makes it arrive. Pieces already present on disk from an
/// earlier run are picked up when metadata attaches.
pub struct SimulatedSwarm {
    shared: Arc<Shared>,
    config: SwarmConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedSwarm {
    /// Starts the download worker.
    ///
    /// # Errors
    /// - `EngineError::Io` - Worker thread could not be spawned
    pub fn start(
        library: Arc<SeedLibrary>,
        faults: Arc<FaultPlan>,
        stats: Arc<SwarmStats>,
        config: SwarmConfig,
    ) -> Result<Self, EngineError> {
        let shared = Arc::new(Shared {
            library,
            faults,
            stats,
            torrents: Mutex::new(HashMap::new()),
            events: EventQueue::default(),
            shutdown: AtomicBool::new(false),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            let config = config.clone();
            thread::Builder::new()
                .name("undertow-sim-swarm".to_string())
                .spawn(move || run_worker(&shared, &config))?
        };

        shared.stats.engines_created.fetch_add(1, Ordering::SeqCst);
        debug!(seed = config.seed, "Simulated swarm started");

        Ok(Self {
            shared,
            config,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

}

impl Drop for SimulatedSwarm {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("Simulated swarm worker panicked");
            }
        }
        debug!("Simulated swarm stopped");
    }
}

impl SwarmEngine for SimulatedSwarm {
    fn add_torrent(&self, params: AddTorrentParams) -> Result<InfoHash, EngineError> {
        let info_hash = params.source.info_hash();
        let mut torrents = self.shared.torrents.lock();
        if torrents.contains_key(&info_hash) {
            return Err(EngineError::DuplicateTorrent { info_hash });
        }

        let now = Instant::now();
        let mut torrent = match &params.source {
            TorrentSource::Description(_) => SimTorrent::new(params.save_path, info_hash, now),
            TorrentSource::Magnet(_) => SimTorrent::new(
                params.save_path,
                info_hash,
                now + self.config.metadata_delay,
            ),
        };

        if let TorrentSource::Description(description) = params.source {
            torrent.attach(description);
            self.shared
                .events
                .push(EngineEvent::MetadataReceived { info_hash });
        }

        torrents.insert(info_hash, torrent);
        self.shared.stats.torrents_added.fetch_add(1, Ordering::SeqCst);
        debug!(%info_hash, "Torrent added");
        Ok(info_hash)
    }

    fn remove_torrent(&self, info_hash: InfoHash, delete_files: bool) -> Result<(), EngineError> {
        let torrent = self
            .shared
            .torrents
            .lock()
            .remove(&info_hash)
            .ok_or(EngineError::TorrentNotFound { info_hash })?;

        if delete_files {
            if let Err(e) = torrent.storage.delete_all() {
                warn!(%info_hash, error = %e, "Failed to delete torrent data");
            }
        }

        self.shared.stats.torrents_removed.fetch_add(1, Ordering::SeqCst);
        self.shared
            .events
            .push(EngineEvent::TorrentRemoved { info_hash });
        debug!(%info_hash, delete_files, "Torrent removed");
        Ok(())
    }

    fn description(&self, info_hash: InfoHash) -> Option<Arc<ContentDescription>> {
        self.shared
            .torrents
            .lock()
            .get(&info_hash)
            .and_then(|torrent| torrent.description.clone())
    }

    fn have_piece(&self, info_hash: InfoHash, piece: PieceIndex) -> bool {
        self.shared
            .torrents
            .lock()
            .get(&info_hash)
            .and_then(|torrent| torrent.have.get(piece.as_usize()).copied())
            .unwrap_or(false)
    }

    fn piece_priority(&self, info_hash: InfoHash, piece: PieceIndex) -> PiecePriority {
        self.shared
            .torrents
            .lock()
            .get(&info_hash)
            .and_then(|torrent| torrent.priorities.get(piece.as_usize()).copied())
            .unwrap_or_default()
    }

    fn set_piece_priority(
        &self,
        info_hash: InfoHash,
        piece: PieceIndex,
        priority: PiecePriority,
    ) -> Result<(), EngineError> {
        let mut torrents = self.shared.torrents.lock();
        let torrent = torrents
            .get_mut(&info_hash)
            .ok_or(EngineError::TorrentNotFound { info_hash })?;
        let slot = torrent
            .priorities
            .get_mut(piece.as_usize())
            .ok_or(EngineError::InvalidPieceIndex { info_hash, piece })?;
        *slot = priority;
        Ok(())
    }

    fn read_piece(&self, info_hash: InfoHash, piece: PieceIndex) -> Result<(), EngineError> {
        let storage = {
            let torrents = self.shared.torrents.lock();
            let torrent = torrents
                .get(&info_hash)
                .ok_or(EngineError::TorrentNotFound { info_hash })?;
            if !torrent.piece_in_range(piece) {
                return Err(EngineError::InvalidPieceIndex { info_hash, piece });
            }
            torrent.storage.clone()
        };

        let result = if self.shared.faults.read_fails(info_hash, piece) {
            Err("Injected read failure".to_string())
        } else {
            storage.load_piece(piece).map_err(|e| e.to_string())
        };

        self.shared.events.push(EngineEvent::PieceRead {
            info_hash,
            piece,
            result,
        });
        Ok(())
    }

    fn poll_events(&self, timeout: Duration) -> Vec<EngineEvent> {
        self.shared.events.drain(timeout)
    }
}

fn run_worker(shared: &Shared, config: &SwarmConfig) {
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);

    while !shared.shutdown.load(Ordering::Acquire) {
        thread::sleep(config.tick);

        let mut torrents = shared.torrents.lock();
        let now = Instant::now();
        for (info_hash, torrent) in torrents.iter_mut() {
            if let Some(reason) = shared.faults.torrent_failure(*info_hash) {
                shared.events.push(EngineEvent::TorrentError {
                    info_hash: *info_hash,
                    reason,
                });
                continue;
            }
            if torrent.description.is_none() {
                if now >= torrent.metadata_due {
                    resolve_metadata(shared, *info_hash, torrent);
                }
                continue;
            }
            download_pieces(shared, config, &mut rng, *info_hash, torrent);
        }
    }
}

fn resolve_metadata(shared: &Shared, info_hash: InfoHash, torrent: &mut SimTorrent) {
    match shared.library.get(info_hash) {
        Some(seed) => {
            torrent.attach(seed.description);
            shared.events.push(EngineEvent::MetadataReceived { info_hash });
        }
        None => {
            // Fail once; the torrent stays until the owner removes it.
            torrent.metadata_due = Instant::now() + Duration::from_secs(3600);
            shared.events.push(EngineEvent::MetadataFailed {
                info_hash,
                reason: "No peers for this info hash".to_string(),
            });
        }
    }
}

fn download_pieces(
    shared: &Shared,
    config: &SwarmConfig,
    rng: &mut ChaCha8Rng,
    info_hash: InfoHash,
    torrent: &mut SimTorrent,
) {
    let Some(seed) = shared.library.get(info_hash) else {
        return;
    };
    let Some(description) = torrent.description.clone() else {
        return;
    };

    let mut wanted: Vec<PieceIndex> = (0..torrent.have.len())
        .filter(|&index| !torrent.have[index] && torrent.priorities[index] > PiecePriority::Idle)
        .map(|index| PieceIndex::new(index as u32))
        .filter(|&piece| !shared.faults.is_withheld(info_hash, piece))
        .collect();
    if wanted.is_empty() {
        return;
    }

    wanted.shuffle(rng);
    wanted.sort_by_key(|piece| std::cmp::Reverse(torrent.priorities[piece.as_usize()]));

    for piece in wanted.into_iter().take(config.pieces_per_tick) {
        let start = description.piece_offset(piece) as usize;
        let end = start + description.piece_size(piece) as usize;
        let Some(piece_bytes) = seed.payload.get(start..end) else {
            warn!(%info_hash, %piece, "Seed payload shorter than description");
            continue;
        };

        let digest = Sha1::digest(piece_bytes);
        if description.piece_hash(piece).map(|hash| &hash[..]) != Some(&digest[..]) {
            shared.stats.pieces_rejected.fetch_add(1, Ordering::SeqCst);
            warn!(%info_hash, %piece, "Piece failed hash check");
            continue;
        }

        if let Err(e) = torrent.storage.store_piece(piece, piece_bytes) {
            shared.events.push(EngineEvent::TorrentError {
                info_hash,
                reason: format!("Failed to store piece {piece}: {e}"),
            });
            continue;
        }

        torrent.have[piece.as_usize()] = true;
        shared.stats.pieces_verified.fetch_add(1, Ordering::SeqCst);
        trace!(%info_hash, %piece, "Piece finished");
        shared
            .events
            .push(EngineEvent::PieceFinished { info_hash, piece });
    }
}
