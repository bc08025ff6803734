//! Content the simulated swarm can serve.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use undertow_core::torrent::{ContentDescription, CreatedContent, InfoHash};

/// Complete copy of one content item held by simulated peers.
#[derive(Debug, Clone)]
pub struct Seed {
    pub description: Arc<ContentDescription>,
    pub payload: Bytes,
}

/// Seeds known to every simulated swarm sharing this library.
///
/// Content missing from the library has no peers: its metadata can never
/// be fetched and its pieces never complete.
#[derive(Debug, Default)]
pub struct SeedLibrary {
    seeds: RwLock<HashMap<InfoHash, Seed>>,
}

impl SeedLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers content and returns its identity.
    pub fn add(&self, created: CreatedContent) -> InfoHash {
        let info_hash = created.description.info_hash;
        self.seeds.write().insert(
            info_hash,
            Seed {
                description: Arc::new(created.description),
                payload: created.payload,
            },
        );
        info_hash
    }

    pub fn get(&self, info_hash: InfoHash) -> Option<Seed> {
        self.seeds.read().get(&info_hash).cloned()
    }

    pub fn contains(&self, info_hash: InfoHash) -> bool {
        self.seeds.read().contains_key(&info_hash)
    }

    pub fn len(&self) -> usize {
        self.seeds.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.read().is_empty()
    }
}
