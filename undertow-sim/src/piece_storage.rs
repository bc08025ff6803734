//! Piece files on disk for the simulated swarm.

use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use undertow_core::torrent::{InfoHash, PieceIndex};

/// Errors from piece persistence.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Piece {index} not found")]
    PieceNotFound { index: PieceIndex },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stores verified pieces as individual files, one directory per torrent:
/// `<save_path>/<info_hash>/piece_<n>`.
#[derive(Debug, Clone)]
pub struct PieceStorage {
    torrent_dir: PathBuf,
}

impl PieceStorage {
    pub fn new(save_path: &Path, info_hash: InfoHash) -> Self {
        Self {
            torrent_dir: save_path.join(info_hash.to_string()),
        }
    }

    pub fn torrent_dir(&self) -> &Path {
        &self.torrent_dir
    }

    fn piece_path(&self, index: PieceIndex) -> PathBuf {
        self.torrent_dir.join(format!("piece_{}", index.as_u32()))
    }

    /// # Errors
    /// - `StorageError::Io` - Directory or file could not be written
    pub fn store_piece(&self, index: PieceIndex, piece_bytes: &[u8]) -> Result<(), StorageError> {
        fs::create_dir_all(&self.torrent_dir)?;
        fs::write(self.piece_path(index), piece_bytes)?;
        Ok(())
    }

    /// # Errors
    /// - `StorageError::PieceNotFound` - No file for this piece
    /// - `StorageError::Io` - File exists but could not be read
    pub fn load_piece(&self, index: PieceIndex) -> Result<Bytes, StorageError> {
        match fs::read(self.piece_path(index)) {
            Ok(piece_bytes) => Ok(Bytes::from(piece_bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::PieceNotFound { index })
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.piece_path(index).exists()
    }

    /// Deletes every stored piece of the torrent. Missing data is not an error.
    ///
    /// # Errors
    /// - `StorageError::Io` - Directory exists but could not be removed
    pub fn delete_all(&self) -> Result<(), StorageError> {
        match fs::remove_dir_all(&self.torrent_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_hash() -> InfoHash {
        InfoHash::new([
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ])
    }

    #[test]
    fn test_store_and_load_piece() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PieceStorage::new(dir.path(), info_hash());

        storage.store_piece(PieceIndex::new(3), b"piece data").unwrap();

        assert!(storage.has_piece(PieceIndex::new(3)));
        assert!(!storage.has_piece(PieceIndex::new(4)));
        assert_eq!(
            &storage.load_piece(PieceIndex::new(3)).unwrap()[..],
            b"piece data"
        );
        assert!(
            dir.path()
                .join(info_hash().to_string())
                .join("piece_3")
                .exists()
        );
    }

    #[test]
    fn test_load_missing_piece() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PieceStorage::new(dir.path(), info_hash());
        assert!(matches!(
            storage.load_piece(PieceIndex::new(0)),
            Err(StorageError::PieceNotFound { .. })
        ));
    }

    #[test]
    fn test_delete_all_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PieceStorage::new(dir.path(), info_hash());
        storage.store_piece(PieceIndex::new(0), b"x").unwrap();

        storage.delete_all().unwrap();
        assert!(!storage.torrent_dir().exists());
        storage.delete_all().unwrap();
    }
}
