//! Piece materialization and sub-range copy.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::UndertowError;
use crate::engine::{EngineSession, Resolution, WaitTarget};
use crate::torrent::{InfoHash, PeerRequest, PieceIndex};

/// Blocks until `piece` is downloaded and verified.
///
/// Returns immediately when the engine already has it.
///
/// # Errors
/// - `UndertowError::Cancelled` - Token fired first
/// - `UndertowError::PieceReadFailed` - Engine reported a torrent error
pub fn wait_for_piece(
    session: &Arc<EngineSession>,
    info_hash: InfoHash,
    piece: PieceIndex,
    cancel: &CancellationToken,
) -> Result<(), UndertowError> {
    // Register before checking, so a completion between the check and the
    // wait is not lost.
    let pending = session.begin_wait(WaitTarget::PieceFinished(info_hash, piece));
    if session.engine().have_piece(info_hash, piece) {
        return Ok(());
    }

    trace!(%info_hash, %piece, "Waiting for piece");
    pending.wait(cancel, None)?;
    Ok(())
}

/// Loads a completed piece into memory.
///
/// # Errors
/// - `UndertowError::Cancelled` - Token fired first
/// - `UndertowError::PieceReadFailed` - Engine could not read the piece
/// - `UndertowError::Engine` - Engine rejected the read request
pub fn read_piece(
    session: &Arc<EngineSession>,
    info_hash: InfoHash,
    piece: PieceIndex,
    cancel: &CancellationToken,
) -> Result<Bytes, UndertowError> {
    let pending = session.begin_wait(WaitTarget::PieceRead(info_hash, piece));
    session.engine().read_piece(info_hash, piece)?;

    match pending.wait(cancel, None)? {
        Resolution::PieceData(bytes) => Ok(bytes),
        Resolution::Ready => Err(UndertowError::PieceReadFailed {
            piece,
            reason: "Read completed without data".to_string(),
        }),
    }
}

/// Copies the requested part of `piece_bytes` into `buf`.
///
/// Copies `min(available - start, buf.len(), request.length)` bytes; a piece
/// shorter than `request.start` yields zero.
pub fn copy_piece_range(piece_bytes: &[u8], request: &PeerRequest, buf: &mut [u8]) -> usize {
    let start = request.start as usize;
    let count = piece_bytes
        .len()
        .saturating_sub(start)
        .min(buf.len())
        .min(request.length as usize);

    if count > 0 {
        buf[..count].copy_from_slice(&piece_bytes[start..start + count]);
    }
    count
}
