//! Scripted engine for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use super::{
    AddTorrentParams, EngineError, EngineEvent, EngineFactory, PiecePriority, SwarmEngine,
    TorrentSource,
};
use crate::torrent::{ContentDescription, InfoHash, PieceIndex};

#[derive(Default)]
struct MockTorrent {
    description: Option<Arc<ContentDescription>>,
    payload: Bytes,
    have: HashSet<PieceIndex>,
    priorities: HashMap<PieceIndex, PiecePriority>,
}

/// Engine whose events are emitted explicitly by the test.
///
/// Adding a description source answers `MetadataReceived` immediately;
/// magnet sources stay pending until the test emits something. Piece
/// completion is driven with [`ScriptedEngine::complete_piece`].
#[derive(Default)]
pub struct ScriptedEngine {
    events: Mutex<VecDeque<EngineEvent>>,
    ready: Condvar,
    torrents: Mutex<HashMap<InfoHash, MockTorrent>>,
    payloads: Mutex<HashMap<InfoHash, Bytes>>,
    pub adds: AtomicUsize,
    pub removals: AtomicUsize,
    pub priority_writes: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: EngineEvent) {
        self.events.lock().push_back(event);
        self.ready.notify_all();
    }

    /// Payload served by `read_piece` for content added later.
    pub fn register_payload(&self, info_hash: InfoHash, payload: Bytes) {
        self.payloads.lock().insert(info_hash, payload);
    }

    /// Marks a piece as downloaded and emits `PieceFinished`.
    pub fn complete_piece(&self, info_hash: InfoHash, piece: PieceIndex) {
        if let Some(torrent) = self.torrents.lock().get_mut(&info_hash) {
            torrent.have.insert(piece);
        }
        self.emit(EngineEvent::PieceFinished { info_hash, piece });
    }

    pub fn contains(&self, info_hash: InfoHash) -> bool {
        self.torrents.lock().contains_key(&info_hash)
    }
}

impl SwarmEngine for ScriptedEngine {
    fn add_torrent(&self, params: AddTorrentParams) -> Result<InfoHash, EngineError> {
        let info_hash = params.source.info_hash();
        let mut torrents = self.torrents.lock();
        if torrents.contains_key(&info_hash) {
            return Err(EngineError::DuplicateTorrent { info_hash });
        }

        let payload = self
            .payloads
            .lock()
            .get(&info_hash)
            .cloned()
            .unwrap_or_default();
        let description = match params.source {
            TorrentSource::Description(description) => Some(description),
            TorrentSource::Magnet(_) => None,
        };
        let known = description.is_some();
        torrents.insert(
            info_hash,
            MockTorrent {
                description,
                payload,
                ..MockTorrent::default()
            },
        );
        drop(torrents);

        self.adds.fetch_add(1, Ordering::SeqCst);
        if known {
            self.emit(EngineEvent::MetadataReceived { info_hash });
        }
        Ok(info_hash)
    }

    fn remove_torrent(&self, info_hash: InfoHash, _delete_files: bool) -> Result<(), EngineError> {
        self.torrents
            .lock()
            .remove(&info_hash)
            .ok_or(EngineError::TorrentNotFound { info_hash })?;
        self.removals.fetch_add(1, Ordering::SeqCst);
        self.emit(EngineEvent::TorrentRemoved { info_hash });
        Ok(())
    }

    fn description(&self, info_hash: InfoHash) -> Option<Arc<ContentDescription>> {
        self.torrents
            .lock()
            .get(&info_hash)
            .and_then(|torrent| torrent.description.clone())
    }

    fn have_piece(&self, info_hash: InfoHash, piece: PieceIndex) -> bool {
        self.torrents
            .lock()
            .get(&info_hash)
            .is_some_and(|torrent| torrent.have.contains(&piece))
    }

    fn piece_priority(&self, info_hash: InfoHash, piece: PieceIndex) -> PiecePriority {
        self.torrents
            .lock()
            .get(&info_hash)
            .and_then(|torrent| torrent.priorities.get(&piece).copied())
            .unwrap_or_default()
    }

    fn set_piece_priority(
        &self,
        info_hash: InfoHash,
        piece: PieceIndex,
        priority: PiecePriority,
    ) -> Result<(), EngineError> {
        let mut torrents = self.torrents.lock();
        let torrent = torrents
            .get_mut(&info_hash)
            .ok_or(EngineError::TorrentNotFound { info_hash })?;
        torrent.priorities.insert(piece, priority);
        self.priority_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_piece(&self, info_hash: InfoHash, piece: PieceIndex) -> Result<(), EngineError> {
        let result = {
            let torrents = self.torrents.lock();
            let torrent = torrents
                .get(&info_hash)
                .ok_or(EngineError::TorrentNotFound { info_hash })?;
            let description = torrent
                .description
                .as_ref()
                .ok_or(EngineError::InvalidPieceIndex { info_hash, piece })?;
            if !torrent.have.contains(&piece) {
                Err(format!("piece {piece} not downloaded"))
            } else {
                let start = description.piece_offset(piece) as usize;
                let end = (start + description.piece_size(piece) as usize).min(torrent.payload.len());
                Ok(torrent.payload.slice(start.min(end)..end))
            }
        };
        self.emit(EngineEvent::PieceRead {
            info_hash,
            piece,
            result,
        });
        Ok(())
    }

    fn poll_events(&self, timeout: Duration) -> Vec<EngineEvent> {
        let mut events = self.events.lock();
        if events.is_empty() {
            self.ready.wait_for(&mut events, timeout);
        }
        events.drain(..).collect()
    }
}

/// Factory handing out one shared [`ScriptedEngine`].
pub struct ScriptedFactory {
    pub engine: Arc<ScriptedEngine>,
    pub created: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self {
            engine: Arc::new(ScriptedEngine::new()),
            created: AtomicUsize::new(0),
        }
    }
}

impl EngineFactory for ScriptedFactory {
    fn create(&self) -> Result<Arc<dyn SwarmEngine>, EngineError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.engine.clone())
    }
}
