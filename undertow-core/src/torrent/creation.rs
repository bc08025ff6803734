//! In-memory content description creation
//!
//! Builds valid descriptions, with real SHA-1 piece hashes, from byte
//! buffers. Used to seed simulated swarms and by tests.

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::parsing::BencodeWriter;
use super::{ContentDescription, TorrentError};

/// Default piece size for created content (32 KiB)
pub const DEFAULT_PIECE_SIZE: u32 = 32_768;

/// Result of a [`ContentCreator::build`] call.
#[derive(Debug, Clone)]
pub struct CreatedContent {
    pub description: ContentDescription,
    /// Encoded description, as it would be stored in a `.torrent` file
    pub torrent_bytes: Vec<u8>,
    /// All file data concatenated in stream order
    pub payload: Bytes,
}

/// Builder for content descriptions over in-memory files.
pub struct ContentCreator {
    piece_size: u32,
    files: Vec<(Vec<String>, Vec<u8>)>,
    announce_urls: Vec<String>,
}

impl ContentCreator {
    /// Creates a creator using [`DEFAULT_PIECE_SIZE`].
    pub fn new() -> Self {
        Self::with_piece_size(DEFAULT_PIECE_SIZE)
    }

    /// Creates a creator with a custom piece size.
    pub fn with_piece_size(piece_size: u32) -> Self {
        Self {
            piece_size,
            files: Vec::new(),
            announce_urls: Vec::new(),
        }
    }

    /// Appends a file. A single file whose path equals the content name
    /// produces a single-file description.
    pub fn add_file(mut self, path: &[&str], data: Vec<u8>) -> Self {
        self.files
            .push((path.iter().map(|s| s.to_string()).collect(), data));
        self
    }

    pub fn with_announce(mut self, url: &str) -> Self {
        self.announce_urls.push(url.to_string());
        self
    }

    /// Encodes the info dictionary and returns the parsed description with
    /// the concatenated payload.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - No files, zero piece size, or no data
    pub fn build(self, name: &str) -> Result<CreatedContent, TorrentError> {
        if self.files.is_empty() {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Cannot create content with no files".to_string(),
            });
        }
        if self.piece_size == 0 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Piece size must be positive".to_string(),
            });
        }

        let payload: Vec<u8> = self
            .files
            .iter()
            .flat_map(|(_, data)| data.iter().copied())
            .collect();

        let pieces: Vec<u8> = payload
            .chunks(self.piece_size as usize)
            .flat_map(|chunk| Sha1::digest(chunk).to_vec())
            .collect();

        let single_file = self.files.len() == 1 && self.files[0].0 == [name];

        let mut info = BencodeWriter::new();
        info.begin_dict();
        if single_file {
            info.string("length").integer(payload.len() as i64);
        } else {
            info.string("files").begin_list();
            for (path, data) in &self.files {
                info.begin_dict()
                    .string("length")
                    .integer(data.len() as i64)
                    .string("path")
                    .begin_list();
                for component in path {
                    info.string(component);
                }
                info.end().end();
            }
            info.end();
        }
        info.string("name")
            .string(name)
            .string("piece length")
            .integer(i64::from(self.piece_size))
            .string("pieces")
            .bytes(&pieces)
            .end();
        let info_bytes = info.finish();

        let description = ContentDescription::from_info_bytes(&info_bytes, self.announce_urls)?;
        let torrent_bytes = description.to_bytes();

        Ok(CreatedContent {
            description,
            torrent_bytes,
            payload: Bytes::from(payload),
        })
    }
}

impl Default for ContentCreator {
    fn default() -> Self {
        Self::new()
    }
}
