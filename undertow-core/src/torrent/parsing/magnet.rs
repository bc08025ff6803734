//! Magnet link parsing utilities

use crate::torrent::{InfoHash, TorrentError};

const MAGNET_PREFIX: &str = "magnet:?";
const BTIH_PREFIX: &str = "xt=urn:btih:";

/// Magnet link components.
///
/// Carries only the identity and hints for finding peers; the full content
/// description has to be fetched from the swarm.
#[derive(Debug, Clone, PartialEq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

/// Magnet link parsing utilities.
pub struct MagnetParser;

impl MagnetParser {
    /// Returns the magnet URI embedded in `locator`, if any.
    ///
    /// Host players sometimes hand over a file path that ends in the magnet
    /// URI, so the last occurrence of the scheme is used.
    pub fn find_magnet(locator: &str) -> Option<&str> {
        locator.rfind(MAGNET_PREFIX).map(|index| &locator[index..])
    }

    /// Parses magnet link to extract torrent information.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMagnetLink` - Malformed magnet URI or missing btih topic
    pub fn parse_magnet_link(magnet_url: &str) -> Result<MagnetLink, TorrentError> {
        let info_hash = Self::extract_info_hash(magnet_url)?;

        let magnet =
            magnet_url::Magnet::new(magnet_url).map_err(|e| TorrentError::InvalidMagnetLink {
                reason: format!("{e}"),
            })?;

        Ok(MagnetLink {
            info_hash,
            display_name: magnet.display_name().map(|s| s.to_string()),
            trackers: magnet.trackers().to_vec(),
        })
    }

    /// Extract info hash from the exact topic (xt) parameter
    fn extract_info_hash(magnet_url: &str) -> Result<InfoHash, TorrentError> {
        let query = magnet_url
            .strip_prefix(MAGNET_PREFIX)
            .ok_or_else(|| TorrentError::InvalidMagnetLink {
                reason: format!("Not a magnet URI: {magnet_url}"),
            })?;

        let xt_value = query
            .split('&')
            .find_map(|param| param.strip_prefix(BTIH_PREFIX))
            .ok_or_else(|| TorrentError::InvalidMagnetLink {
                reason: format!("Missing or invalid info hash in magnet link: {magnet_url}"),
            })?;

        InfoHash::from_hex(xt_value).map_err(|e| TorrentError::InvalidMagnetLink {
            reason: e.to_string(),
        })
    }
}
