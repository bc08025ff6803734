//! Undertow Core - blocking random-access reads over swarm-distributed content
//!
//! Content is fetched piece by piece by a swarm engine running on its own
//! thread. This crate turns that event-driven engine into a synchronous
//! `read(file, offset, buf)` interface: reads raise piece priorities around
//! the requested range, block until the covering piece is local, and copy the
//! bytes out. Open content is deduplicated per identity and torn down when the
//! last handle is released.

pub mod config;
pub mod content;
pub mod engine;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;

pub use config::UndertowConfig;
pub use content::{ContentHandle, ContentRegistry, ContentSource, ContentState};
pub use engine::{EngineError, EngineFactory, PiecePriority, SwarmEngine};
pub use streaming::ContentReader;
pub use tokio_util::sync::CancellationToken;
pub use torrent::{ContentDescription, InfoHash, PieceIndex, TorrentError};

/// Errors surfaced by the public content API.
///
/// Creation-time failures (`DescriptionParse`, `CreationFailed`) abort the
/// open attempt. Everything else is reported per read call and leaves the
/// handle usable.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Malformed content description: {reason}")]
    DescriptionParse { reason: String },

    #[error("Could not create content {info_hash}: {reason}")]
    CreationFailed { info_hash: String, reason: String },

    #[error("File index {index} out of range ({file_count} files)")]
    FileNotFound { index: usize, file_count: usize },

    #[error("No file with path {path}")]
    PathNotFound { path: String },

    #[error("Invalid read offset {offset}")]
    InvalidOffset { offset: i64 },

    #[error("Failed to read piece {piece}: {reason}")]
    PieceReadFailed { piece: PieceIndex, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out waiting for {operation}")]
    TimedOut { operation: String },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// True for cooperative cancellation, which means "retry or give up",
    /// not "this content is broken".
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UndertowError::Cancelled)
    }

    /// Checks if this error is due to caller input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::DescriptionParse { .. }
                | UndertowError::FileNotFound { .. }
                | UndertowError::PathNotFound { .. }
                | UndertowError::InvalidOffset { .. }
        )
    }
}

impl From<TorrentError> for UndertowError {
    fn from(error: TorrentError) -> Self {
        match error {
            TorrentError::Io(io) => UndertowError::Io(io),
            other => UndertowError::DescriptionParse {
                reason: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_torrent_error_maps_to_parse_error() {
        let error: UndertowError = TorrentError::InvalidTorrentFile {
            reason: "truncated".to_string(),
        }
        .into();
        assert!(matches!(error, UndertowError::DescriptionParse { .. }));
        assert!(error.is_user_error());
        assert!(error.to_string().contains("truncated"));
    }

    #[test]
    fn test_io_passes_through() {
        let error: UndertowError =
            TorrentError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")).into();
        assert!(matches!(error, UndertowError::Io(_)));
        assert!(!error.is_user_error());
    }

    #[test]
    fn test_cancelled_is_not_user_error() {
        assert!(UndertowError::Cancelled.is_cancelled());
        assert!(!UndertowError::Cancelled.is_user_error());
        assert!(
            !UndertowError::PieceReadFailed {
                piece: PieceIndex::new(1),
                reason: "disk".to_string(),
            }
            .is_cancelled()
        );
    }
}
