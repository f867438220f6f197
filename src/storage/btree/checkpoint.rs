use std::sync::atomic::Ordering as AtomicOrdering;

use tracing::{info, warn};

use super::meta::CheckpointRecord;
use super::tree::{GbpTree, TreeInner};
use crate::primitives::pager::IoLimiter;
use crate::storage::layout::Layout;
use crate::types::{Result, TreeError};

impl<L: Layout> GbpTree<L> {
    /// Makes every mutation so far durable.
    ///
    /// Dirty pages are flushed in batches paced by `limiter`, then the
    /// inactive checkpoint slot is written and synced. On failure the handle
    /// refuses further writes and checkpoints; reopening the file recovers the
    /// previous checkpoint.
    pub fn checkpoint(&self, limiter: &dyn IoLimiter) -> Result<()> {
        let inner = self.inner();
        let _guard = inner
            .writer_slot
            .try_acquire()
            .ok_or(TreeError::Usage("checkpoint while a writer is open"))?;
        inner.ensure_healthy()?;
        let result = inner.run_checkpoint(limiter);
        if let Err(err) = &result {
            inner.failed.store(true, AtomicOrdering::Release);
            warn!(target: "gbptree::checkpoint", error = %err, "checkpoint failed; tree handle disabled");
        }
        result
    }
}

impl<L: Layout> TreeInner<L> {
    fn run_checkpoint(&self, limiter: &dyn IoLimiter) -> Result<()> {
        let state = self.snapshot();
        info!(
            target: "gbptree::checkpoint",
            stable = state.stable,
            unstable = state.unstable,
            "checkpoint started"
        );
        let (free_head, next_page) = {
            let mut free = self.free.lock();
            let head = free.persist(self.cache.as_ref(), self.salt, state.unstable)?;
            (head, free.next_page())
        };
        let flushed = self.cache.flush(limiter)?;
        self.cache.sync()?;

        let record = CheckpointRecord {
            stable: state.unstable,
            unstable: state.unstable + 1,
            root: state.root,
            free_head,
            next_page,
            clean: false,
        };
        let slot = 1 - state.active_slot;
        self.write_record(slot, &record)?;

        {
            let mut current = self.state.write();
            current.stable = record.stable;
            current.unstable = record.unstable;
            current.active_slot = slot;
        }
        self.free.lock().promote(record.stable);
        self.modified.store(false, AtomicOrdering::Release);
        self.stats.inc_checkpoints();
        info!(
            target: "gbptree::checkpoint",
            pages = flushed,
            stable = record.stable,
            unstable = record.unstable,
            "checkpoint completed"
        );
        Ok(())
    }
}
