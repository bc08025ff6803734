//! Undertow Simulation - deterministic swarm engine for development and tests.
//!
//! Implements the `SwarmEngine` contract from `undertow-core` without any
//! networking. Content registered in a [`SeedLibrary`] plays the role of the
//! swarm: metadata for it resolves, its pieces arrive in priority order and
//! are verified and stored exactly as a real engine would store them.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use undertow_core::torrent::ContentCreator;
//! use undertow_core::{CancellationToken, ContentRegistry, ContentSource, UndertowConfig};
//! use undertow_sim::SimulatedSwarmFactory;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = Arc::new(SimulatedSwarmFactory::default());
//! let created = ContentCreator::new()
//!     .add_file(&["movie.mkv"], vec![0u8; 1 << 20])
//!     .build("movie.mkv")?;
//! let torrent_bytes = created.torrent_bytes.clone();
//! factory.library().add(created);
//!
//! let registry = ContentRegistry::new(factory, UndertowConfig::default());
//! let handle = registry.open_default(
//!     ContentSource::Description(torrent_bytes),
//!     &CancellationToken::new(),
//! )?;
//! let mut buf = vec![0u8; 4096];
//! let read = handle.read(0, 0, &mut buf, &CancellationToken::new())?;
//! # let _ = read;
//! # Ok(())
//! # }
//! ```

pub mod piece_storage;
pub mod seed_library;
pub mod swarm;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use undertow_core::engine::{EngineError, EngineFactory, SwarmEngine};

pub use piece_storage::{PieceStorage, StorageError};
pub use seed_library::{Seed, SeedLibrary};
pub use swarm::{FaultPlan, SimulatedSwarm, SwarmConfig, SwarmStats};

/// Builds [`SimulatedSwarm`] engines that share one library, fault plan
/// and set of counters.
#[derive(Default)]
pub struct SimulatedSwarmFactory {
    library: Arc<SeedLibrary>,
    faults: Arc<FaultPlan>,
    stats: Arc<SwarmStats>,
    config: SwarmConfig,
    current: Mutex<Weak<SimulatedSwarm>>,
}

impl SimulatedSwarmFactory {
    pub fn new(config: SwarmConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn library(&self) -> &Arc<SeedLibrary> {
        &self.library
    }

    pub fn faults(&self) -> &Arc<FaultPlan> {
        &self.faults
    }

    pub fn stats(&self) -> &Arc<SwarmStats> {
        &self.stats
    }

    /// Most recently created engine, if it is still running.
    pub fn current_swarm(&self) -> Option<Arc<SimulatedSwarm>> {
        self.current.lock().upgrade()
    }
}

impl EngineFactory for SimulatedSwarmFactory {
    fn create(&self) -> Result<Arc<dyn SwarmEngine>, EngineError> {
        let swarm = Arc::new(SimulatedSwarm::start(
            Arc::clone(&self.library),
            Arc::clone(&self.faults),
            Arc::clone(&self.stats),
            self.config.clone(),
        )?);
        *self.current.lock() = Arc::downgrade(&swarm);
        Ok(swarm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_counts_engines() {
        let factory = SimulatedSwarmFactory::default();
        let first = factory.create().unwrap();
        assert!(factory.current_swarm().is_some());
        drop(first);
        assert!(factory.current_swarm().is_none());

        let _second = factory.create().unwrap();
        assert_eq!(factory.stats().engines_created(), 2);
    }
}
