use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct TreeStatsSnapshot {
    /// Number of leaf splits performed
    pub leaf_splits: u64,
    /// Number of internal node splits performed
    pub internal_splits: u64,
    /// Number of sibling merges performed
    pub merges: u64,
    /// Number of sibling rebalances performed
    pub rebalances: u64,
    /// Number of stable pages copied before being modified
    pub cow_copies: u64,
    /// Number of descents restarted after reaching a stale page
    pub generation_chases: u64,
    /// Number of times the tree grew a level
    pub root_splits: u64,
    /// Number of times the tree lost a level
    pub root_collapses: u64,
    /// Number of completed checkpoints
    pub checkpoints: u64,
}

/// Thread-safe statistics tracking for tree operations.
#[derive(Default)]
pub struct TreeStats {
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    merges: AtomicU64,
    rebalances: AtomicU64,
    cow_copies: AtomicU64,
    generation_chases: AtomicU64,
    root_splits: AtomicU64,
    root_collapses: AtomicU64,
    checkpoints: AtomicU64,
}

macro_rules! counter {
    ($get:ident, $inc:ident, $doc:literal) => {
        #[doc = $doc]
        pub fn $get(&self) -> u64 {
            self.$get.load(AtomicOrdering::Relaxed)
        }

        pub(crate) fn $inc(&self) {
            self.$get.fetch_add(1, AtomicOrdering::Relaxed);
        }
    };
}

impl TreeStats {
    counter!(leaf_splits, inc_leaf_splits, "Returns the current count of leaf splits.");
    counter!(
        internal_splits,
        inc_internal_splits,
        "Returns the current count of internal node splits."
    );
    counter!(merges, inc_merges, "Returns the current count of sibling merges.");
    counter!(
        rebalances,
        inc_rebalances,
        "Returns the current count of sibling rebalances."
    );
    counter!(
        cow_copies,
        inc_cow_copies,
        "Returns how many stable pages were copied on write."
    );
    counter!(
        generation_chases,
        inc_generation_chases,
        "Returns how many descents restarted after reaching a stale page."
    );
    counter!(root_splits, inc_root_splits, "Returns how many times the root split.");
    counter!(
        root_collapses,
        inc_root_collapses,
        "Returns how many times an empty internal root was removed."
    );
    counter!(checkpoints, inc_checkpoints, "Returns the number of completed checkpoints.");

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        TreeStatsSnapshot {
            leaf_splits: self.leaf_splits(),
            internal_splits: self.internal_splits(),
            merges: self.merges(),
            rebalances: self.rebalances(),
            cow_copies: self.cow_copies(),
            generation_chases: self.generation_chases(),
            root_splits: self.root_splits(),
            root_collapses: self.root_collapses(),
            checkpoints: self.checkpoints(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "gbptree::stats",
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            merges = snapshot.merges,
            rebalances = snapshot.rebalances,
            cow_copies = snapshot.cow_copies,
            generation_chases = snapshot.generation_chases,
            root_splits = snapshot.root_splits,
            root_collapses = snapshot.root_collapses,
            checkpoints = snapshot.checkpoints,
            "tree stats snapshot"
        );
    }
}
