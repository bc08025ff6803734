//! Swarm engine contract and the blocking bridge built on top of it.
//!
//! The swarm engine itself is an external collaborator reached through the
//! [`SwarmEngine`] trait. [`EngineSession`] owns one engine instance and the
//! pump thread that fans its events out to listeners, and
//! [`PendingCompletion`] turns a single expected event into a blocking,
//! cancellable wait.

pub mod completion;
pub mod session;
#[cfg(test)]
pub(crate) mod test_mocks;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
pub use completion::{PendingCompletion, Resolution, WaitTarget};
pub use session::{EngineSession, ListenerId};

use crate::torrent::{ContentDescription, InfoHash, MagnetLink, PieceIndex};

/// Download priority of a single piece.
///
/// Ordered so that a larger value is more urgent. New content starts with
/// every piece `Idle`, meaning it is not fetched until a read asks for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PiecePriority {
    /// Not requested by any reader
    #[default]
    Idle = 0,
    /// Look-ahead window, fetched opportunistically
    Normal = 1,
    /// Margin around a requested range
    High = 2,
    /// Inside a requested range
    Critical = 3,
}

/// What the engine should start downloading.
#[derive(Debug, Clone)]
pub enum TorrentSource {
    /// Full description known up front
    Description(Arc<ContentDescription>),
    /// Identity only; the description must be fetched from the swarm
    Magnet(MagnetLink),
}

impl TorrentSource {
    pub fn info_hash(&self) -> InfoHash {
        match self {
            TorrentSource::Description(description) => description.info_hash,
            TorrentSource::Magnet(magnet) => magnet.info_hash,
        }
    }
}

/// Parameters for [`SwarmEngine::add_torrent`].
#[derive(Debug, Clone)]
pub struct AddTorrentParams {
    pub source: TorrentSource,
    pub save_path: std::path::PathBuf,
}

/// Notifications emitted by the engine, drained by the session pump.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Description is available and downloading can start
    MetadataReceived { info_hash: InfoHash },
    /// Description could not be obtained
    MetadataFailed { info_hash: InfoHash, reason: String },
    /// Fatal per-torrent failure (storage, protocol)
    TorrentError { info_hash: InfoHash, reason: String },
    /// Piece downloaded and verified
    PieceFinished {
        info_hash: InfoHash,
        piece: PieceIndex,
    },
    /// Answer to [`SwarmEngine::read_piece`]
    PieceRead {
        info_hash: InfoHash,
        piece: PieceIndex,
        result: Result<Bytes, String>,
    },
    /// Torrent removed from the engine
    TorrentRemoved { info_hash: InfoHash },
}

impl EngineEvent {
    pub fn info_hash(&self) -> InfoHash {
        match self {
            EngineEvent::MetadataReceived { info_hash }
            | EngineEvent::MetadataFailed { info_hash, .. }
            | EngineEvent::TorrentError { info_hash, .. }
            | EngineEvent::PieceFinished { info_hash, .. }
            | EngineEvent::PieceRead { info_hash, .. }
            | EngineEvent::TorrentRemoved { info_hash } => *info_hash,
        }
    }
}

/// Operations consumed from the swarm engine.
///
/// Every method returns promptly. Long-running work (metadata exchange,
/// piece transfer, piece reads, removal) is reported through events that the
/// session pump collects with [`SwarmEngine::poll_events`].
pub trait SwarmEngine: Send + Sync {
    /// Starts a torrent. Emits `MetadataReceived` or `MetadataFailed` later.
    ///
    /// # Errors
    /// - `EngineError::DuplicateTorrent` - Identity already present
    /// - `EngineError::Rejected` - Engine refused the parameters
    fn add_torrent(&self, params: AddTorrentParams) -> Result<InfoHash, EngineError>;

    /// Removes a torrent, optionally deleting its data. Emits `TorrentRemoved`.
    ///
    /// # Errors
    /// - `EngineError::TorrentNotFound` - Unknown identity
    fn remove_torrent(&self, info_hash: InfoHash, delete_files: bool) -> Result<(), EngineError>;

    /// Description once metadata is available.
    fn description(&self, info_hash: InfoHash) -> Option<Arc<ContentDescription>>;

    /// Whether the piece is downloaded and verified.
    fn have_piece(&self, info_hash: InfoHash, piece: PieceIndex) -> bool;

    fn piece_priority(&self, info_hash: InfoHash, piece: PieceIndex) -> PiecePriority;

    /// # Errors
    /// - `EngineError::TorrentNotFound` - Unknown identity
    /// - `EngineError::InvalidPieceIndex` - Piece out of range
    fn set_piece_priority(
        &self,
        info_hash: InfoHash,
        piece: PieceIndex,
        priority: PiecePriority,
    ) -> Result<(), EngineError>;

    /// Requests the piece bytes. Answered by a `PieceRead` event.
    ///
    /// # Errors
    /// - `EngineError::TorrentNotFound` - Unknown identity
    /// - `EngineError::InvalidPieceIndex` - Piece out of range
    fn read_piece(&self, info_hash: InfoHash, piece: PieceIndex) -> Result<(), EngineError>;

    /// Waits up to `timeout` for events and drains everything pending.
    fn poll_events(&self, timeout: Duration) -> Vec<EngineEvent>;
}

/// Creates engine instances for new sessions.
pub trait EngineFactory: Send + Sync {
    /// # Errors
    /// - `EngineError::Rejected` - Engine could not be started
    fn create(&self) -> Result<Arc<dyn SwarmEngine>, EngineError>;
}

/// Failures reported synchronously by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("Torrent {info_hash} already added")]
    DuplicateTorrent { info_hash: InfoHash },

    #[error("Piece {piece} out of range for torrent {info_hash}")]
    InvalidPieceIndex {
        info_hash: InfoHash,
        piece: PieceIndex,
    },

    #[error("Engine rejected request: {reason}")]
    Rejected { reason: String },

    #[error("Engine has shut down")]
    EngineShutdown,

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(PiecePriority::Critical > PiecePriority::High);
        assert!(PiecePriority::High > PiecePriority::Normal);
        assert!(PiecePriority::Normal > PiecePriority::Idle);
        assert_eq!(PiecePriority::default(), PiecePriority::Idle);
    }

    #[test]
    fn test_event_info_hash() {
        let info_hash = InfoHash::new([9u8; 20]);
        let event = EngineEvent::PieceRead {
            info_hash,
            piece: PieceIndex::new(1),
            result: Err("disk".to_string()),
        };
        assert_eq!(event.info_hash(), info_hash);
    }
}
