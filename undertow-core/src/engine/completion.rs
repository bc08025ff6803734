//! One-shot blocking waits on engine events.
//!
//! A wait is described declaratively by a [`WaitTarget`]. Registering it
//! installs a listener on the session; the first matching event resolves the
//! wait and later events are ignored. The listener is removed when the
//! [`PendingCompletion`] is dropped, which covers every exit path.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::session::{EngineSession, ListenerId};
use super::EngineEvent;
use crate::torrent::{InfoHash, PieceIndex};
use crate::UndertowError;

/// The event a caller is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Metadata(InfoHash),
    PieceFinished(InfoHash, PieceIndex),
    PieceRead(InfoHash, PieceIndex),
    Removed(InfoHash),
}

/// Value carried by a successful wait.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Ready,
    PieceData(Bytes),
}

type Outcome = Result<Resolution, UndertowError>;

impl WaitTarget {
    pub fn info_hash(&self) -> InfoHash {
        match *self {
            WaitTarget::Metadata(info_hash)
            | WaitTarget::PieceFinished(info_hash, _)
            | WaitTarget::PieceRead(info_hash, _)
            | WaitTarget::Removed(info_hash) => info_hash,
        }
    }

    /// Outcome of `event` for this wait, or `None` when it does not concern it.
    ///
    /// Error events for the same identity fail metadata and piece waits.
    pub fn resolve(&self, event: &EngineEvent) -> Option<Outcome> {
        if event.info_hash() != self.info_hash() {
            return None;
        }

        match (*self, event) {
            (WaitTarget::Metadata(_), EngineEvent::MetadataReceived { .. }) => {
                Some(Ok(Resolution::Ready))
            }
            (
                WaitTarget::Metadata(info_hash),
                EngineEvent::MetadataFailed { reason, .. }
                | EngineEvent::TorrentError { reason, .. },
            ) => Some(Err(UndertowError::CreationFailed {
                info_hash: info_hash.to_string(),
                reason: reason.clone(),
            })),
            (WaitTarget::Metadata(info_hash), EngineEvent::TorrentRemoved { .. }) => {
                Some(Err(UndertowError::CreationFailed {
                    info_hash: info_hash.to_string(),
                    reason: "Torrent removed before metadata arrived".to_string(),
                }))
            }

            (WaitTarget::PieceFinished(_, wanted), EngineEvent::PieceFinished { piece, .. })
                if *piece == wanted =>
            {
                Some(Ok(Resolution::Ready))
            }
            (WaitTarget::PieceRead(_, wanted), EngineEvent::PieceRead { piece, result, .. })
                if *piece == wanted =>
            {
                Some(match result {
                    Ok(bytes) => Ok(Resolution::PieceData(bytes.clone())),
                    Err(reason) => Err(UndertowError::PieceReadFailed {
                        piece: wanted,
                        reason: reason.clone(),
                    }),
                })
            }
            (
                WaitTarget::PieceFinished(_, piece) | WaitTarget::PieceRead(_, piece),
                EngineEvent::TorrentError { reason, .. },
            ) => Some(Err(UndertowError::PieceReadFailed {
                piece,
                reason: reason.clone(),
            })),
            (
                WaitTarget::PieceFinished(_, piece) | WaitTarget::PieceRead(_, piece),
                EngineEvent::TorrentRemoved { .. },
            ) => Some(Err(UndertowError::PieceReadFailed {
                piece,
                reason: "Torrent removed".to_string(),
            })),

            (WaitTarget::Removed(_), EngineEvent::TorrentRemoved { .. }) => {
                Some(Ok(Resolution::Ready))
            }

            _ => None,
        }
    }
}

impl fmt::Display for WaitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitTarget::Metadata(info_hash) => write!(f, "metadata for {info_hash}"),
            WaitTarget::PieceFinished(info_hash, piece) => {
                write!(f, "piece {piece} of {info_hash}")
            }
            WaitTarget::PieceRead(info_hash, piece) => {
                write!(f, "read of piece {piece} of {info_hash}")
            }
            WaitTarget::Removed(info_hash) => write!(f, "removal of {info_hash}"),
        }
    }
}

#[derive(Default)]
struct CompletionSlot {
    outcome: Mutex<Option<Outcome>>,
    resolved: Condvar,
}

impl CompletionSlot {
    /// Stores the first outcome only.
    fn offer(&self, outcome: Outcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.resolved.notify_all();
        }
    }
}

/// One outstanding wait. Resolved at most once, never reused.
pub struct PendingCompletion {
    session: Arc<EngineSession>,
    listener: ListenerId,
    slot: Arc<CompletionSlot>,
    target: WaitTarget,
}

impl PendingCompletion {
    pub(crate) fn register(session: Arc<EngineSession>, target: WaitTarget) -> Self {
        let slot = Arc::new(CompletionSlot::default());
        let listener = {
            let slot = Arc::clone(&slot);
            session.register_listener(move |event| {
                if let Some(outcome) = target.resolve(event) {
                    slot.offer(outcome);
                }
            })
        };
        trace!(wait = %target, "Registered wait");

        Self {
            session,
            listener,
            slot,
            target,
        }
    }

    /// Blocks until the wait resolves, `cancel` fires or `timeout` elapses.
    ///
    /// Cancellation is noticed within one poll interval. A resolved outcome
    /// takes precedence over a cancellation observed at the same check.
    ///
    /// # Errors
    /// - `UndertowError::Cancelled` - Token fired before resolution
    /// - `UndertowError::TimedOut` - `timeout` elapsed first
    /// - Any failure carried by the resolving event
    pub fn wait(
        self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Resolution, UndertowError> {
        let poll_interval = self.session.poll_interval();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let mut outcome = self.slot.outcome.lock();
        loop {
            if let Some(result) = outcome.take() {
                return result;
            }

            if cancel.is_cancelled() {
                debug!(wait = %self.target, "Wait cancelled");
                return Err(UndertowError::Cancelled);
            }

            let mut step = poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    debug!(wait = %self.target, "Wait timed out");
                    return Err(UndertowError::TimedOut {
                        operation: self.target.to_string(),
                    });
                }
                step = step.min(deadline - now);
            }

            self.slot.resolved.wait_for(&mut outcome, step);
        }
    }
}

impl Drop for PendingCompletion {
    fn drop(&mut self) {
        self.session.unregister_listener(self.listener);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::engine::test_mocks::ScriptedEngine;

    const POLL: Duration = Duration::from_millis(25);

    fn session() -> (Arc<ScriptedEngine>, Arc<EngineSession>) {
        let engine = Arc::new(ScriptedEngine::new());
        let session = EngineSession::start(engine.clone(), POLL).unwrap();
        (engine, session)
    }

    fn hash(byte: u8) -> InfoHash {
        InfoHash::new([byte; 20])
    }

    #[test]
    fn test_resolve_ignores_other_identities() {
        let target = WaitTarget::Metadata(hash(1));
        let event = EngineEvent::MetadataReceived {
            info_hash: hash(2),
        };
        assert!(target.resolve(&event).is_none());
    }

    #[test]
    fn test_resolve_ignores_other_pieces() {
        let target = WaitTarget::PieceFinished(hash(1), PieceIndex::new(3));
        let event = EngineEvent::PieceFinished {
            info_hash: hash(1),
            piece: PieceIndex::new(4),
        };
        assert!(target.resolve(&event).is_none());
    }

    #[test]
    fn test_error_event_fails_metadata_wait() {
        let target = WaitTarget::Metadata(hash(1));
        let event = EngineEvent::TorrentError {
            info_hash: hash(1),
            reason: "tracker refused".to_string(),
        };
        match target.resolve(&event) {
            Some(Err(UndertowError::CreationFailed { reason, .. })) => {
                assert_eq!(reason, "tracker refused");
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn test_failed_piece_read_event() {
        let target = WaitTarget::PieceRead(hash(1), PieceIndex::new(0));
        let event = EngineEvent::PieceRead {
            info_hash: hash(1),
            piece: PieceIndex::new(0),
            result: Err("disk gone".to_string()),
        };
        assert!(matches!(
            target.resolve(&event),
            Some(Err(UndertowError::PieceReadFailed { .. }))
        ));
    }

    #[test]
    fn test_torrent_error_fails_blocked_piece_wait() {
        let (engine, session) = session();
        let pending = session.begin_wait(WaitTarget::PieceFinished(hash(1), PieceIndex::new(5)));

        let emitter = {
            let engine = engine.clone();
            thread::spawn(move || {
                thread::sleep(POLL);
                engine.emit(EngineEvent::TorrentError {
                    info_hash: hash(1),
                    reason: "storage full".to_string(),
                });
            })
        };

        let err = pending.wait(&CancellationToken::new(), None).unwrap_err();
        emitter.join().unwrap();
        match err {
            UndertowError::PieceReadFailed { piece, reason } => {
                assert_eq!(piece, PieceIndex::new(5));
                assert_eq!(reason, "storage full");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(session.listener_count(), 0);
    }

    #[test]
    fn test_removal_fails_pending_piece_read() {
        let (engine, session) = session();
        let pending = session.begin_wait(WaitTarget::PieceRead(hash(1), PieceIndex::new(0)));

        engine.emit(EngineEvent::TorrentRemoved {
            info_hash: hash(2),
        });
        engine.emit(EngineEvent::TorrentRemoved {
            info_hash: hash(1),
        });

        assert!(matches!(
            pending.wait(&CancellationToken::new(), None),
            Err(UndertowError::PieceReadFailed { .. })
        ));
    }

    #[test]
    fn test_wait_resolves_with_piece_data() {
        let (engine, session) = session();
        let pending = session.begin_wait(WaitTarget::PieceRead(hash(1), PieceIndex::new(2)));

        engine.emit(EngineEvent::PieceRead {
            info_hash: hash(1),
            piece: PieceIndex::new(2),
            result: Ok(Bytes::from_static(b"data")),
        });

        let resolution = pending.wait(&CancellationToken::new(), None).unwrap();
        assert_eq!(resolution, Resolution::PieceData(Bytes::from_static(b"data")));
        assert_eq!(session.listener_count(), 0);
    }

    #[test]
    fn test_first_resolution_wins() {
        let (engine, session) = session();
        let pending = session.begin_wait(WaitTarget::Metadata(hash(1)));

        engine.emit(EngineEvent::MetadataReceived {
            info_hash: hash(1),
        });
        engine.emit(EngineEvent::MetadataFailed {
            info_hash: hash(1),
            reason: "late".to_string(),
        });

        assert_eq!(
            pending.wait(&CancellationToken::new(), None).unwrap(),
            Resolution::Ready
        );
    }

    #[test]
    fn test_cancellation_unblocks_within_two_poll_intervals() {
        let (_engine, session) = session();
        let pending = session.begin_wait(WaitTarget::PieceFinished(hash(1), PieceIndex::new(0)));
        let cancel = CancellationToken::new();

        let trigger = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(POLL);
                cancel.cancel();
                Instant::now()
            })
        };

        let result = pending.wait(&cancel, None);
        let returned = Instant::now();
        let cancelled_at = trigger.join().unwrap();

        assert!(matches!(result, Err(UndertowError::Cancelled)));
        assert!(returned.duration_since(cancelled_at) <= POLL * 2);
        assert_eq!(session.listener_count(), 0);
    }

    #[test]
    fn test_timeout_reports_operation() {
        let (_engine, session) = session();
        let pending = session.begin_wait(WaitTarget::Removed(hash(7)));

        let err = pending
            .wait(&CancellationToken::new(), Some(Duration::from_millis(40)))
            .unwrap_err();
        match err {
            UndertowError::TimedOut { operation } => assert!(operation.contains("removal")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(session.listener_count(), 0);
    }

    #[test]
    fn test_dropped_wait_deregisters_listener() {
        let (_engine, session) = session();
        let pending = session.begin_wait(WaitTarget::Metadata(hash(1)));
        assert_eq!(session.listener_count(), 1);
        drop(pending);
        assert_eq!(session.listener_count(), 0);
    }
}
