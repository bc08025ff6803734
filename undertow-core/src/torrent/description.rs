//! Decoded content description and byte-to-piece mapping.

use std::ops::RangeInclusive;

use bytes::Bytes;

use super::parsing::bencode::BencodeParser;
use super::parsing::BencodeWriter;
use super::{InfoHash, PieceIndex, TorrentError};

/// Complete description of one content item.
///
/// Lists the constituent files in stream order and the piece layout. The
/// raw info dictionary is retained so the description can be re-serialized
/// without changing its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentDescription {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub files: Vec<ContentFile>,
    pub announce_urls: Vec<String>,
    multi_file: bool,
    info_bytes: Bytes,
}

/// Individual file within a torrent.
///
/// `offset` is the position of the file's first byte in the concatenated
/// content stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentFile {
    pub path: Vec<String>,
    pub length: u64,
    pub offset: u64,
}

/// A byte range inside a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRequest {
    pub piece: PieceIndex,
    /// Offset of the first requested byte within the piece
    pub start: u32,
    /// Bytes available from `start`, clamped to both the piece and file end
    pub length: u32,
}

impl ContentDescription {
    /// Decodes a bencoded content description.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode or missing fields
    pub fn parse(torrent_bytes: &[u8]) -> Result<Self, TorrentError> {
        let (info_bytes, announce_urls) = BencodeParser::split_description(torrent_bytes)?;
        Self::from_info_bytes(info_bytes, announce_urls)
    }

    /// Builds a description from a raw info dictionary, as received through
    /// metadata exchange.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - Malformed info dictionary
    pub fn from_info_bytes(
        info_bytes: &[u8],
        announce_urls: Vec<String>,
    ) -> Result<Self, TorrentError> {
        let fields = BencodeParser::parse_info(info_bytes)?;

        Ok(Self {
            info_hash: BencodeParser::calculate_info_hash(info_bytes),
            name: fields.name,
            piece_length: fields.piece_length,
            piece_hashes: fields.piece_hashes,
            total_length: fields.total_length,
            files: fields.files,
            announce_urls,
            multi_file: fields.multi_file,
            info_bytes: Bytes::copy_from_slice(info_bytes),
        })
    }

    /// Re-serializes the description. Parsing the result yields the same
    /// info hash.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = BencodeWriter::new();
        writer.begin_dict();

        if let Some(primary) = self.announce_urls.first() {
            writer.string("announce").string(primary);
        }

        if self.announce_urls.len() > 1 {
            writer.string("announce-list").begin_list();
            for url in &self.announce_urls {
                writer.begin_list().string(url).end();
            }
            writer.end();
        }

        writer.string("info").raw(&self.info_bytes).end();
        writer.finish()
    }

    /// Raw bencoded info dictionary.
    pub fn info_bytes(&self) -> &Bytes {
        &self.info_bytes
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Size of `piece` in bytes; the last piece may be short.
    pub fn piece_size(&self, piece: PieceIndex) -> u32 {
        let start = self.piece_offset(piece);
        if start >= self.total_length {
            return 0;
        }
        (self.total_length - start).min(u64::from(self.piece_length)) as u32
    }

    /// Offset of the piece's first byte in the content stream.
    pub fn piece_offset(&self, piece: PieceIndex) -> u64 {
        u64::from(piece.as_u32()) * u64::from(self.piece_length)
    }

    pub fn piece_hash(&self, piece: PieceIndex) -> Option<&[u8; 20]> {
        self.piece_hashes.get(piece.as_usize())
    }

    /// Piece containing the given content-stream offset.
    pub fn piece_at(&self, stream_offset: u64) -> PieceIndex {
        PieceIndex::new((stream_offset / u64::from(self.piece_length)) as u32)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn file(&self, index: usize) -> Option<&ContentFile> {
        self.files.get(index)
    }

    /// Display path of a file. Multi-file content nests every file under the
    /// content name.
    pub fn file_path(&self, index: usize) -> Option<String> {
        let file = self.files.get(index)?;
        let joined = file.path.join("/");
        if self.multi_file {
            Some(format!("{}/{joined}", self.name))
        } else {
            Some(joined)
        }
    }

    /// `(path, size)` for every file, in stream order.
    pub fn file_entries(&self) -> Vec<(String, u64)> {
        (0..self.files.len())
            .filter_map(|index| Some((self.file_path(index)?, self.files[index].length)))
            .collect()
    }

    /// Index of the file whose display path equals `path`.
    pub fn find_file(&self, path: &str) -> Option<usize> {
        (0..self.files.len()).find(|&index| self.file_path(index).as_deref() == Some(path))
    }

    /// Pieces overlapping `length` bytes starting at `offset` within `file`,
    /// clamped to the file. `None` when the range is empty.
    pub fn piece_span(
        &self,
        file: usize,
        offset: u64,
        length: u64,
    ) -> Option<RangeInclusive<PieceIndex>> {
        let entry = self.files.get(file)?;
        if offset >= entry.length || length == 0 {
            return None;
        }
        let end = offset.saturating_add(length).min(entry.length);
        let first = self.piece_at(entry.offset + offset);
        let last = self.piece_at(entry.offset + end - 1);
        Some(first..=last)
    }

    /// Maps a file-relative byte range to the piece holding its first byte.
    ///
    /// Returns `None` when `file` is out of range or `offset` is at or past
    /// the end of the file.
    pub fn map_file(&self, file: usize, offset: u64, length: usize) -> Option<PeerRequest> {
        let entry = self.files.get(file)?;
        if offset >= entry.length {
            return None;
        }

        let stream_offset = entry.offset + offset;
        let piece = self.piece_at(stream_offset);
        let start = (stream_offset - self.piece_offset(piece)) as u32;

        let in_piece = u64::from(self.piece_size(piece).saturating_sub(start));
        let in_file = entry.length - offset;
        let length = (length as u64).min(in_piece).min(in_file) as u32;

        Some(PeerRequest {
            piece,
            start,
            length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::ContentCreator;

    fn three_file_description() -> ContentDescription {
        ContentCreator::with_piece_size(512)
            .add_file(&["denmark.png"], vec![1u8; 476])
            .add_file(&["norway.png"], vec![2u8; 744])
            .add_file(&["sweden.png"], vec![3u8; 636])
            .build("flags")
            .unwrap()
            .description
    }

    #[test]
    fn test_piece_sizes_with_short_tail() {
        let description = three_file_description();
        assert_eq!(description.total_length, 1856);
        assert_eq!(description.piece_count(), 4);
        assert_eq!(description.piece_size(PieceIndex::new(0)), 512);
        assert_eq!(description.piece_size(PieceIndex::new(3)), 1856 - 3 * 512);
        assert_eq!(description.piece_size(PieceIndex::new(4)), 0);
    }

    #[test]
    fn test_map_file_clamps_to_piece_and_file_end() {
        let description = three_file_description();

        // norway.png starts at 476, inside piece 0
        let request = description.map_file(1, 0, 4096).unwrap();
        assert_eq!(request.piece, PieceIndex::new(0));
        assert_eq!(request.start, 476);
        assert_eq!(request.length, 512 - 476);

        // last bytes of norway.png end inside piece 2
        let request = description.map_file(1, 700, 4096).unwrap();
        assert_eq!(request.piece, PieceIndex::new(2));
        assert_eq!(request.length, 44);
    }

    #[test]
    fn test_map_file_past_end() {
        let description = three_file_description();
        assert!(description.map_file(0, 476, 10).is_none());
        assert!(description.map_file(5, 0, 10).is_none());
    }

    #[test]
    fn test_piece_span_covers_file_range() {
        let description = three_file_description();
        let span = description.piece_span(2, 0, u64::MAX).unwrap();
        assert_eq!(*span.start(), PieceIndex::new(2));
        assert_eq!(*span.end(), PieceIndex::new(3));
        assert!(description.piece_span(2, 636, 1).is_none());
    }

    #[test]
    fn test_file_paths_and_lookup() {
        let description = three_file_description();
        assert_eq!(
            description.file_entries(),
            vec![
                ("flags/denmark.png".to_string(), 476),
                ("flags/norway.png".to_string(), 744),
                ("flags/sweden.png".to_string(), 636),
            ]
        );
        assert_eq!(description.find_file("flags/sweden.png"), Some(2));
        assert_eq!(description.find_file("sweden.png"), None);
    }

    #[test]
    fn test_round_trip_preserves_identity() {
        let mut description = three_file_description();
        description.announce_urls = vec![
            "http://tracker.example.com/announce".to_string(),
            "udp://backup.example.com:1337".to_string(),
        ];

        let reparsed = ContentDescription::parse(&description.to_bytes()).unwrap();
        assert_eq!(reparsed.info_hash, description.info_hash);
        assert_eq!(reparsed.announce_urls, description.announce_urls);
        assert_eq!(reparsed.files, description.files);
    }

    #[test]
    fn test_identity_of_hand_encoded_description() {
        let torrent = b"d8:announce30:udp://tracker.example.org:13377:comment5:flags4:infod5:filesld6:lengthi476e4:pathl11:denmark.pngeed6:lengthi744e4:pathl10:norway.pngeed6:lengthi636e4:pathl10:sweden.pngeee4:name5:flags12:piece lengthi16384e6:pieces20:AAAAAAAAAAAAAAAAAAAAee";

        let description = ContentDescription::parse(torrent).unwrap();

        assert_eq!(
            description.info_hash.to_string(),
            "9fef43b0306d855ce50ad2090337c68ffeb4f299"
        );
        assert_eq!(description.info_bytes().first(), Some(&b'd'));
        assert_eq!(description.info_bytes().len(), torrent.len() - 67);
        assert_eq!(description.announce_urls, vec!["udp://tracker.example.org:1337"]);
        assert_eq!(description.piece_count(), 1);
    }
}
