//! Bencode decoding logic and info hash calculation

use sha1::{Digest, Sha1};

use crate::torrent::{ContentFile, InfoHash, TorrentError};

// Type aliases for complex bencode types
pub(crate) type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
pub(crate) type ParseResult<T> = Result<T, TorrentError>;
pub(crate) type BytesResult<'a> = Result<&'a [u8], TorrentError>;
pub(crate) type FilesResult = ParseResult<(Vec<ContentFile>, u64)>;

/// Fields extracted from a bencoded info dictionary.
pub(crate) struct InfoFields {
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<ContentFile>,
    pub total_length: u64,
    pub multi_file: bool,
}

/// Bencode parsing utilities for content description extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Parses the outer description and returns the raw info dictionary
    /// bytes together with the announce URLs.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If bencode parsing failed or the info field is missing
    pub fn split_description(torrent_bytes: &[u8]) -> ParseResult<(&[u8], Vec<String>)> {
        let root = Self::parse_root_dict(torrent_bytes)?;
        let bencode_rs::Value::Dictionary(dict) = &root else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Root element must be dictionary".to_string(),
            });
        };

        if !dict.contains_key(b"info".as_slice()) {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Missing 'info' field".to_string(),
            });
        }

        let info_bytes = Self::find_dictionary_entry(torrent_bytes, b"info")?;
        let announce_urls = Self::extract_announce_urls(dict);

        Ok((info_bytes, announce_urls))
    }

    /// Decodes the fields of a raw info dictionary.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If a required field is missing or malformed
    pub(crate) fn parse_info(info_bytes: &[u8]) -> ParseResult<InfoFields> {
        let root = Self::parse_root_dict(info_bytes)?;
        let bencode_rs::Value::Dictionary(info_dict) = &root else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Info field must be dictionary".to_string(),
            });
        };

        let name = Self::extract_bytes_as_string(info_dict, b"name")?;
        let piece_length = Self::extract_integer(info_dict, b"piece length")?;
        if piece_length <= 0 || piece_length > i64::from(u32::MAX) {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!("Invalid piece length: {piece_length}"),
            });
        }
        let piece_length = piece_length as u32;

        let pieces_bytes = Self::extract_bytes(info_dict, b"pieces")?;
        if !pieces_bytes.len().is_multiple_of(20) {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Invalid pieces length".to_string(),
            });
        }

        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, total_length, multi_file) =
            if let Ok(length) = Self::extract_integer(info_dict, b"length") {
                let length = Self::non_negative(length, "length")?;
                let files = vec![ContentFile {
                    path: vec![name.clone()],
                    length,
                    offset: 0,
                }];
                (files, length, false)
            } else if let Some(bencode_rs::Value::List(files_list)) =
                info_dict.get(b"files".as_slice())
            {
                let (files, total_length) = Self::extract_files_info(files_list)?;
                (files, total_length, true)
            } else {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Missing 'files' or 'length' field".to_string(),
                });
            };

        if total_length == 0 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Content has no data".to_string(),
            });
        }

        let expected_pieces = total_length.div_ceil(u64::from(piece_length));
        if piece_hashes.len() as u64 != expected_pieces {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Piece count mismatch: {} hashes for {expected_pieces} pieces",
                    piece_hashes.len()
                ),
            });
        }

        Ok(InfoFields {
            name,
            piece_length,
            piece_hashes,
            files,
            total_length,
            multi_file,
        })
    }

    /// SHA-1 over the exact info dictionary bytes.
    pub fn calculate_info_hash(info_bytes: &[u8]) -> InfoHash {
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        let hash_result = hasher.finalize();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hash_result);

        InfoHash::new(hash)
    }

    fn parse_root_dict(data: &[u8]) -> ParseResult<bencode_rs::Value<'_>> {
        if data.first() != Some(&b'd') {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Root element must be dictionary".to_string(),
            });
        }

        let mut parsed =
            bencode_rs::Value::parse(data).map_err(|e| TorrentError::InvalidTorrentFile {
                reason: format!("Bencode parsing failed: {e:?}"),
            })?;

        if parsed.is_empty() {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Empty bencode data".to_string(),
            });
        }

        Ok(parsed.swap_remove(0))
    }

    /// Locates the raw bytes of `key`'s value in the top-level dictionary.
    ///
    /// Walks keys in order rather than searching for the key text, so a
    /// value that happens to contain the key bytes cannot be mistaken for it.
    fn find_dictionary_entry<'a>(data: &'a [u8], key: &[u8]) -> BytesResult<'a> {
        if data.first() != Some(&b'd') {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Expected dictionary start".to_string(),
            });
        }

        let mut pos = 1;
        while pos < data.len() && data[pos] != b'e' {
            let (key_start, key_end) = Self::string_span(data, pos)?;
            let value_start = key_end;
            let value_end = Self::find_value_end(data, value_start)?;

            if &data[key_start..key_end] == key {
                return Ok(&data[value_start..value_end]);
            }
            pos = value_end;
        }

        Err(TorrentError::InvalidTorrentFile {
            reason: format!("Missing '{}' field", String::from_utf8_lossy(key)),
        })
    }

    /// Returns `(content_start, content_end)` of the byte string at `pos`.
    fn string_span(data: &[u8], pos: usize) -> ParseResult<(usize, usize)> {
        let mut colon = pos;
        while colon < data.len() && data[colon] != b':' {
            colon += 1;
        }
        if colon >= data.len() || colon == pos {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Invalid string format".to_string(),
            });
        }

        let length: usize = std::str::from_utf8(&data[pos..colon])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TorrentError::InvalidTorrentFile {
                reason: "Invalid string length".to_string(),
            })?;

        let start = colon + 1;
        let end = start
            .checked_add(length)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| TorrentError::InvalidTorrentFile {
                reason: "String exceeds input".to_string(),
            })?;

        Ok((start, end))
    }

    /// Find the end position (exclusive) of the bencode value starting at `start`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the value is malformed or truncated
    pub fn find_value_end(data: &[u8], start: usize) -> Result<usize, TorrentError> {
        let mut pos = start;
        let mut depth = 0usize;

        loop {
            let Some(&byte) = data.get(pos) else {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Incomplete bencode value".to_string(),
                });
            };

            match byte {
                b'd' | b'l' => {
                    depth += 1;
                    pos += 1;
                }
                b'e' if depth > 0 => {
                    depth -= 1;
                    pos += 1;
                }
                b'i' => {
                    pos += 1;
                    while pos < data.len() && data[pos] != b'e' {
                        pos += 1;
                    }
                    if pos >= data.len() {
                        return Err(TorrentError::InvalidTorrentFile {
                            reason: "Unterminated integer".to_string(),
                        });
                    }
                    pos += 1;
                }
                b'0'..=b'9' => {
                    let (_, end) = Self::string_span(data, pos)?;
                    pos = end;
                }
                _ => {
                    return Err(TorrentError::InvalidTorrentFile {
                        reason: "Invalid bencode character".to_string(),
                    });
                }
            }

            if depth == 0 {
                return Ok(pos);
            }
        }
    }

    fn non_negative(value: i64, field: &str) -> ParseResult<u64> {
        u64::try_from(value).map_err(|_| TorrentError::InvalidTorrentFile {
            reason: format!("Negative {field}: {value}"),
        })
    }

    /// Extract string from bencode dictionary
    fn extract_bytes_as_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| TorrentError::InvalidTorrentFile {
            reason: format!("Invalid UTF-8 in field: {:?}", String::from_utf8_lossy(key)),
        })
    }

    /// Extract bytes from bencode dictionary
    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> BytesResult<'a> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Missing or invalid field: {:?}",
                    String::from_utf8_lossy(key)
                ),
            }),
        }
    }

    /// Extract integer from bencode dictionary
    fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => Ok(*value),
            _ => Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Missing or invalid integer field: {:?}",
                    String::from_utf8_lossy(key)
                ),
            }),
        }
    }

    /// Extract files information from multi-file torrent, assigning each
    /// file its byte offset in the concatenated content stream.
    fn extract_files_info(files_list: &[bencode_rs::Value<'_>]) -> FilesResult {
        let mut files = Vec::with_capacity(files_list.len());
        let mut total_length = 0u64;

        for file_value in files_list {
            let bencode_rs::Value::Dictionary(file_dict) = file_value else {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Invalid file entry type".to_string(),
                });
            };

            let length = Self::non_negative(Self::extract_integer(file_dict, b"length")?, "length")?;

            let Some(bencode_rs::Value::List(path_list)) = file_dict.get(b"path".as_slice()) else {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Missing or invalid path in file".to_string(),
                });
            };

            let mut path = Vec::with_capacity(path_list.len());
            for path_component in path_list {
                let bencode_rs::Value::Bytes(component) = path_component else {
                    return Err(TorrentError::InvalidTorrentFile {
                        reason: "Invalid path component type".to_string(),
                    });
                };
                let component = String::from_utf8(component.to_vec()).map_err(|_| {
                    TorrentError::InvalidTorrentFile {
                        reason: "Invalid UTF-8 in file path".to_string(),
                    }
                })?;
                path.push(component);
            }

            if path.is_empty() {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Empty file path".to_string(),
                });
            }

            files.push(ContentFile {
                path,
                length,
                offset: total_length,
            });
            total_length = total_length.checked_add(length).ok_or_else(|| {
                TorrentError::InvalidTorrentFile {
                    reason: "Total content length overflows".to_string(),
                }
            })?;
        }

        Ok((files, total_length))
    }

    /// Extract announce URLs from the description, deduplicated in order.
    fn extract_announce_urls(dict: &BencodeDict<'_>) -> Vec<String> {
        let mut announce_urls: Vec<String> = Vec::new();
        let mut push = |url: String| {
            if !announce_urls.contains(&url) {
                announce_urls.push(url);
            }
        };

        if let Ok(announce) = Self::extract_bytes_as_string(dict, b"announce") {
            push(announce);
        }

        if let Some(bencode_rs::Value::List(announce_list)) = dict.get(b"announce-list".as_slice())
        {
            for tier in announce_list {
                if let bencode_rs::Value::List(tier_urls) = tier {
                    for url_value in tier_urls {
                        if let bencode_rs::Value::Bytes(url_bytes) = url_value
                            && let Ok(url) = String::from_utf8(url_bytes.to_vec())
                        {
                            push(url);
                        }
                    }
                }
            }
        }

        announce_urls
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_find_value_end_incomplete() {
        assert!(BencodeParser::find_value_end(b"d3:key", 0).is_err());
        assert!(BencodeParser::find_value_end(b"d3:key999:", 0).is_err());
        assert!(BencodeParser::find_value_end(b"i42", 0).is_err());
    }

    #[test]
    fn test_find_dictionary_entry_returns_exact_span() {
        let data = b"d1:ai1e4:infod1:xi2ee1:zi3ee";
        let info = BencodeParser::find_dictionary_entry(data, b"info").unwrap();
        assert_eq!(info, b"d1:xi2ee");
    }

    #[test]
    fn test_extract_bytes() {
        let mut bencode_dict = HashMap::new();
        bencode_dict.insert(b"test".as_slice(), bencode_rs::Value::Bytes(b"value"));

        let result = BencodeParser::extract_bytes(&bencode_dict, b"test").unwrap();
        assert_eq!(result, b"value");
        assert!(BencodeParser::extract_bytes(&bencode_dict, b"missing").is_err());
    }

    #[test]
    fn test_extract_bytes_as_string_invalid_utf8() {
        let mut bencode_dict = HashMap::new();
        bencode_dict.insert(b"test".as_slice(), bencode_rs::Value::Bytes(&[0xFF, 0xFE]));

        assert!(BencodeParser::extract_bytes_as_string(&bencode_dict, b"test").is_err());
    }

    #[test]
    fn test_extract_files_info_assigns_offsets() {
        let file_entry = |length: i64, name: &'static [u8]| {
            let mut file_dict = HashMap::new();
            file_dict.insert(b"length".as_slice(), bencode_rs::Value::Integer(length));
            file_dict.insert(
                b"path".as_slice(),
                bencode_rs::Value::List(vec![bencode_rs::Value::Bytes(name)]),
            );
            bencode_rs::Value::Dictionary(file_dict)
        };

        let files_list = vec![file_entry(524288, b"file1.txt"), file_entry(1048576, b"file2.dat")];
        let (files, total_length) = BencodeParser::extract_files_info(&files_list).unwrap();

        assert_eq!(total_length, 524288 + 1048576);
        assert_eq!(files[0].offset, 0);
        assert_eq!(files[1].offset, 524288);
        assert_eq!(files[1].path, vec!["file2.dat"]);
    }

    #[test]
    fn test_extract_files_info_rejects_negative_length() {
        let mut file_dict = HashMap::new();
        file_dict.insert(b"length".as_slice(), bencode_rs::Value::Integer(-1));
        file_dict.insert(
            b"path".as_slice(),
            bencode_rs::Value::List(vec![bencode_rs::Value::Bytes(b"a")]),
        );

        let result =
            BencodeParser::extract_files_info(&[bencode_rs::Value::Dictionary(file_dict)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_total_length_overflow_is_rejected() {
        let info = b"d5:filesld6:lengthi9223372036854775807e4:pathl1:aeed6:lengthi9223372036854775807e4:pathl1:beed6:lengthi9223372036854775807e4:pathl1:ceee4:name1:x12:piece lengthi16384e6:pieces20:01234567890123456789e";
        let err = BencodeParser::parse_info(info).err().unwrap();
        assert!(err.to_string().contains("Total content length overflows"));
    }

    #[test]
    fn test_announce_list_is_deduplicated() {
        let torrent = b"d8:announce9:test.com:13:announce-listll9:test.com:el11:backup.com:ee4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces20:01234567890123456789ee";
        let (_, urls) = BencodeParser::split_description(torrent).unwrap();
        assert_eq!(urls, vec!["test.com:", "backup.com:"]);
    }

    #[test]
    fn test_piece_count_mismatch_is_rejected() {
        // 1000 bytes in 100-byte pieces needs 10 hashes, only 1 given
        let info = b"d6:lengthi1000e4:name1:a12:piece lengthi100e6:pieces20:01234567890123456789e";
        let err = BencodeParser::parse_info(info).err().unwrap();
        assert!(err.to_string().contains("Piece count mismatch"));
    }
}
