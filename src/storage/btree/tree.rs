use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::cursor::Cursor;
use super::freelist::FreeList;
use super::meta::{self, CheckpointRecord, TreeMeta, META_PAGE};
use super::page::{max_entry_len, EntryFormat, Node};
use super::pointer::GenPointer;
use super::stats::{TreeStats, TreeStatsSnapshot};
use super::writer::Writer;
use crate::primitives::concurrency::SingleWriter;
use crate::primitives::pager::{PageCache, Pager, PagerOptions};
use crate::storage::layout::Layout;
use crate::types::page::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::types::{PageId, Result, TreeError};

/// Configuration knobs for a tree.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TreeOptions {
    /// Page cache settings, used by [`GbpTree::open_path`].
    pub pager: PagerOptions,
    /// Root-to-leaf restarts a reader attempts after landing on a stale page.
    pub max_generation_chase_retries: u32,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            pager: PagerOptions::default(),
            max_generation_chase_retries: 64,
        }
    }
}

impl TreeOptions {
    /// Parses options from TOML; missing fields keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| TreeError::Config(err.to_string()))
    }
}

/// Root pointer and generations shared by every session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct TreeState {
    pub root: GenPointer,
    pub stable: u64,
    pub unstable: u64,
    /// Checkpoint slot holding the newest durable record.
    pub active_slot: usize,
}

pub(crate) struct TreeInner<L: Layout> {
    pub cache: Arc<dyn PageCache>,
    pub layout: Arc<L>,
    pub options: TreeOptions,
    pub salt: u64,
    pub page_size: usize,
    pub format: EntryFormat,
    pub state: RwLock<TreeState>,
    pub free: Mutex<FreeList>,
    pub writer_slot: SingleWriter,
    /// Set when a checkpoint or a mutation failed half-way.
    pub failed: AtomicBool,
    /// Set by every mutation, cleared by checkpoints.
    pub modified: AtomicBool,
    pub stats: TreeStats,
}

/// Generation-based copy-on-write B+ tree over a [`PageCache`].
///
/// Any number of cursors may run alongside at most one [`Writer`].
/// Mutations become durable only through [`GbpTree::checkpoint`].
pub struct GbpTree<L: Layout> {
    inner: Arc<TreeInner<L>>,
}

impl<L: Layout> GbpTree<L> {
    /// Opens the tree stored in `cache`, creating it if the file is empty.
    pub fn open(cache: Arc<dyn PageCache>, layout: L, options: TreeOptions) -> Result<Self> {
        let page_size = cache.page_size();
        if page_size < MIN_PAGE_SIZE as usize || page_size > MAX_PAGE_SIZE as usize {
            return Err(TreeError::Invalid(
                "page cache page size outside 1 KiB to 64 KiB",
            ));
        }
        let format = EntryFormat::of(&layout);
        let fixed_entry = format.key_size.unwrap_or(0) + format.value_size.unwrap_or(0);
        if fixed_entry > max_entry_len(page_size) {
            return Err(TreeError::Invalid("layout entries do not fit four to a page"));
        }
        let layout = Arc::new(layout);
        let fresh = cache.page_count()? == 0 || {
            let page = cache.read(META_PAGE)?;
            page.data().iter().all(|b| *b == 0)
        };
        let inner = if fresh {
            Self::create(cache, layout, options, format)?
        } else {
            Self::open_existing(cache, layout, options, format)?
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Opens or creates the tree file at `path` behind a [`Pager`] built from
    /// `options.pager`.
    pub fn open_path(path: impl AsRef<Path>, layout: L, options: TreeOptions) -> Result<Self> {
        let cache: Arc<dyn PageCache> = Arc::new(Pager::open_path(path, &options.pager)?);
        Self::open(cache, layout, options)
    }

    fn create(
        cache: Arc<dyn PageCache>,
        layout: Arc<L>,
        options: TreeOptions,
        format: EntryFormat,
    ) -> Result<TreeInner<L>> {
        let page_size = cache.page_size();
        let meta = TreeMeta::for_layout(layout.as_ref(), page_size as u32);
        let root_page = PageId(1);
        let mut root = Node::new_leaf();
        root.page = Some(root_page);
        {
            let mut page = cache.write(root_page)?;
            root.encode(page.data_mut(), &format, meta.salt)?;
        }
        cache.flush_page(root_page)?;
        cache.sync()?;

        let record = CheckpointRecord {
            stable: 0,
            unstable: 1,
            root: root.pointer(),
            free_head: PageId(0),
            next_page: 2,
            clean: false,
        };
        {
            let mut page = cache.write(META_PAGE)?;
            let buf = page.data_mut();
            buf.fill(0);
            meta::write_meta(buf, &meta)?;
            meta::write_record(buf, 0, &record);
        }
        cache.flush_page(META_PAGE)?;
        cache.sync()?;
        info!(
            target: "gbptree::tree",
            page_size,
            layout = format_args!("{:#018x}", meta.layout_id),
            "created tree"
        );
        Ok(TreeInner {
            cache,
            layout,
            options,
            salt: meta.salt,
            page_size,
            format,
            state: RwLock::new(TreeState {
                root: record.root,
                stable: record.stable,
                unstable: record.unstable,
                active_slot: 0,
            }),
            free: Mutex::new(FreeList::new(record.next_page)),
            writer_slot: SingleWriter::new(),
            failed: AtomicBool::new(false),
            modified: AtomicBool::new(false),
            stats: TreeStats::default(),
        })
    }

    fn open_existing(
        cache: Arc<dyn PageCache>,
        layout: Arc<L>,
        options: TreeOptions,
        format: EntryFormat,
    ) -> Result<TreeInner<L>> {
        let page_size = cache.page_size();
        let (meta, slot, record) = {
            let page = cache.read(META_PAGE)?;
            let meta = meta::read_meta(page.data(), layout.as_ref(), page_size as u32)?;
            let (slot, record) = meta::active_record(page.data())?;
            (meta, slot, record)
        };
        if record.unstable <= record.stable || record.root.is_null() {
            return Err(TreeError::Corruption("checkpoint record generations out of order"));
        }
        let free = FreeList::load(
            cache.as_ref(),
            record.free_head,
            record.next_page,
            meta.salt,
            record.stable,
        )?;

        let inner = TreeInner {
            cache,
            layout,
            options,
            salt: meta.salt,
            page_size,
            format,
            state: RwLock::new(TreeState {
                root: record.root,
                stable: record.stable,
                unstable: record.unstable + 1,
                active_slot: 1 - slot,
            }),
            free: Mutex::new(free),
            writer_slot: SingleWriter::new(),
            failed: AtomicBool::new(false),
            modified: AtomicBool::new(false),
            stats: TreeStats::default(),
        };
        let bumped = CheckpointRecord {
            unstable: record.unstable + 1,
            clean: false,
            ..record
        };
        inner.write_record(1 - slot, &bumped)?;
        info!(
            target: "gbptree::tree",
            stable = record.stable,
            unstable = bumped.unstable,
            clean = record.clean,
            "opened tree"
        );
        if !record.clean {
            let cleared = inner.clean_crashed_pointers()?;
            info!(
                target: "gbptree::tree",
                cleared,
                "tree was not closed cleanly; cleared crashed pointer slots"
            );
        }
        Ok(inner)
    }

    /// Opens the single writer session.
    pub fn writer(&self) -> Result<Writer<L>> {
        let guard = self
            .inner
            .writer_slot
            .try_acquire()
            .ok_or(TreeError::ConcurrentWriter)?;
        self.inner.ensure_healthy()?;
        Ok(Writer::new(Arc::clone(&self.inner), guard))
    }

    /// Positions a cursor over keys in `[from, to)`.
    pub fn seek(&self, from: &L::Key, to: &L::Key) -> Result<Cursor<L>> {
        let from = self.inner.encode_key(from);
        let to = self.inner.encode_key(to);
        Cursor::open(Arc::clone(&self.inner), from, to)
    }

    /// Point lookup.
    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>> {
        let key = self.inner.encode_key(key);
        let descent = self.inner.descend(&key)?;
        let leaf = descent.leaf;
        match leaf.search(&key, |a, b| self.inner.layout.compare(a, b)) {
            Ok(idx) => Ok(Some(self.inner.layout.read_value(&leaf.values[idx])?)),
            Err(_) => Ok(None),
        }
    }

    /// Closes the tree, flushing the cache.
    ///
    /// Mutations since the last checkpoint stay unreachable on disk; when
    /// there are none the active record is rewritten with the clean flag set.
    pub fn close(self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner
            .writer_slot
            .try_acquire()
            .ok_or(TreeError::Usage("close while a writer is open"))?;
        inner.cache.flush(&crate::primitives::pager::Unlimited)?;
        inner.cache.sync()?;
        let clean = !inner.modified.load(AtomicOrdering::Acquire)
            && !inner.failed.load(AtomicOrdering::Acquire);
        if clean {
            let state = *inner.state.read();
            let record = CheckpointRecord {
                stable: state.stable,
                unstable: state.unstable + 1,
                root: state.root,
                free_head: inner.free_head()?,
                next_page: inner.free.lock().next_page(),
                clean: true,
            };
            inner.write_record(1 - state.active_slot, &record)?;
        }
        info!(target: "gbptree::tree", clean, "closed tree");
        inner.stats.emit_tracing();
        Ok(())
    }

    /// Live statistics counters.
    pub fn stats(&self) -> &TreeStats {
        &self.inner.stats
    }

    /// Snapshot of the statistics counters.
    pub fn stats_snapshot(&self) -> TreeStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Generation of the last checkpoint.
    pub fn stable_generation(&self) -> u64 {
        self.inner.state.read().stable
    }

    /// Generation stamped on pages written now.
    pub fn unstable_generation(&self) -> u64 {
        self.inner.state.read().unstable
    }

    /// Layout the tree was opened with.
    pub fn layout(&self) -> &L {
        &self.inner.layout
    }

    pub(crate) fn inner(&self) -> &Arc<TreeInner<L>> {
        &self.inner
    }
}

impl<L: Layout> TreeInner<L> {
    pub(crate) fn encode_key(&self, key: &L::Key) -> Vec<u8> {
        let mut out = Vec::new();
        self.layout.write_key(key, &mut out);
        out
    }

    pub(crate) fn snapshot(&self) -> TreeState {
        *self.state.read()
    }

    pub(crate) fn ensure_healthy(&self) -> Result<()> {
        if self.failed.load(AtomicOrdering::Acquire) {
            return Err(TreeError::Usage(
                "tree handle failed during a write or checkpoint; reopen the file",
            ));
        }
        Ok(())
    }

    /// Free-list head of the active durable record.
    fn free_head(&self) -> Result<PageId> {
        let page = self.cache.read(META_PAGE)?;
        let (_, record) = meta::active_record(page.data())?;
        Ok(record.free_head)
    }

    /// Writes `record` into checkpoint slot `slot` and makes it durable.
    pub(crate) fn write_record(&self, slot: usize, record: &CheckpointRecord) -> Result<()> {
        {
            let mut page = self.cache.write(META_PAGE)?;
            meta::write_record(page.data_mut(), slot, record);
        }
        self.cache.flush_page(META_PAGE)?;
        self.cache.sync()?;
        debug!(
            target: "gbptree::tree",
            slot,
            stable = record.stable,
            unstable = record.unstable,
            clean = record.clean,
            "checkpoint record written"
        );
        Ok(())
    }
}
