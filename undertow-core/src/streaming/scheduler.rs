//! Distance-based piece prioritization for byte-range reads.
//!
//! A read of `(file, offset, length)` raises:
//! - pieces overlapping the requested bytes to `Critical`
//! - pieces within the margin before or after the range to `High`
//! - pieces within the look-ahead window after the range to `Normal`
//!
//! Windows are clamped to the file being read. Priorities only ever go up,
//! and pieces the engine already has are left alone.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::config::SchedulerConfig;
use crate::engine::{EngineError, PiecePriority, SwarmEngine};
use crate::torrent::{ContentDescription, InfoHash, PieceIndex};

/// Piece tiers computed for one read request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityPlan {
    tiers: BTreeMap<PieceIndex, PiecePriority>,
}

impl PriorityPlan {
    /// Computes the tiers for reading `length` bytes at `offset` of `file`.
    ///
    /// Returns an empty plan for an unknown file or an empty range.
    pub fn for_range(
        description: &ContentDescription,
        file: usize,
        offset: u64,
        length: u64,
        config: &SchedulerConfig,
    ) -> Self {
        let mut plan = Self::default();
        let Some(entry) = description.file(file) else {
            return plan;
        };
        if offset >= entry.length || length == 0 {
            return plan;
        }

        let end = offset.saturating_add(length).min(entry.length);
        let margin = config.margin_for(entry.length);
        let lookahead = config.lookahead_for(entry.length);

        plan.raise_bytes(description, file, end, lookahead, PiecePriority::Normal);

        let before = offset.saturating_sub(margin);
        plan.raise_bytes(description, file, before, offset - before, PiecePriority::High);
        plan.raise_bytes(description, file, end, margin, PiecePriority::High);

        plan.raise_bytes(description, file, offset, end - offset, PiecePriority::Critical);
        plan
    }

    fn raise_bytes(
        &mut self,
        description: &ContentDescription,
        file: usize,
        offset: u64,
        length: u64,
        tier: PiecePriority,
    ) {
        if let Some(span) = description.piece_span(file, offset, length) {
            for index in span.start().as_u32()..=span.end().as_u32() {
                self.raise(PieceIndex::new(index), tier);
            }
        }
    }

    /// Max-merge of `tier` into the entry for `piece`.
    pub fn raise(&mut self, piece: PieceIndex, tier: PiecePriority) {
        let entry = self.tiers.entry(piece).or_default();
        *entry = (*entry).max(tier);
    }

    /// Tier for `piece`, `Idle` when the plan does not mention it.
    pub fn tier(&self, piece: PieceIndex) -> PiecePriority {
        self.tiers.get(&piece).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PieceIndex, PiecePriority)> + '_ {
        self.tiers.iter().map(|(piece, tier)| (*piece, *tier))
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

/// Applies priority plans to one content item.
///
/// Read-compare-raise against the engine runs under one lock per content
/// item, so concurrent readers can only ever raise a piece's priority.
pub struct PriorityScheduler {
    config: SchedulerConfig,
    apply_lock: Mutex<()>,
}

impl PriorityScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            apply_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Plans and applies priorities for one read. Returns the number of
    /// pieces whose priority was raised.
    ///
    /// # Errors
    /// - `EngineError` - Engine rejected a priority change
    pub fn schedule(
        &self,
        engine: &dyn SwarmEngine,
        description: &ContentDescription,
        file: usize,
        offset: u64,
        length: u64,
    ) -> Result<usize, EngineError> {
        let plan = PriorityPlan::for_range(description, file, offset, length, &self.config);
        self.apply(engine, description.info_hash, &plan)
    }

    /// Raises engine priorities to at least the plan's tiers.
    ///
    /// Pieces already downloaded are skipped. A piece whose current
    /// priority is already higher keeps it.
    ///
    /// # Errors
    /// - `EngineError` - Engine rejected a priority change
    pub fn apply(
        &self,
        engine: &dyn SwarmEngine,
        info_hash: InfoHash,
        plan: &PriorityPlan,
    ) -> Result<usize, EngineError> {
        let _guard = self.apply_lock.lock();
        let mut raised = 0;

        for (piece, tier) in plan.iter() {
            if engine.have_piece(info_hash, piece) {
                continue;
            }
            if engine.piece_priority(info_hash, piece) >= tier {
                continue;
            }
            engine.set_piece_priority(info_hash, piece, tier)?;
            raised += 1;
        }

        if raised > 0 {
            trace!(%info_hash, planned = plan.len(), raised, "Raised piece priorities");
        }
        Ok(raised)
    }
}
