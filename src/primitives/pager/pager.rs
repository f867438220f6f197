use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock, RwLock,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::frame::{Frame, PinGuard};
use super::limiter::IoLimiter;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{
    page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE},
    PageId, Result, TreeError,
};

/// Configuration options for the pager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagerOptions {
    /// Size of each page in bytes; a power of two between 1 KiB and 64 KiB.
    pub page_size: u32,
    /// Number of pages to cache in memory.
    pub cache_pages: usize,
    /// Dirty pages written between two calls into the [`IoLimiter`].
    pub flush_batch_pages: usize,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
            flush_batch_pages: 64,
        }
    }
}

/// Statistics tracking pager operations.
#[derive(Default, Clone, Debug)]
pub struct PagerStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of page evictions from cache.
    pub evictions: u64,
    /// Number of dirty pages written back on eviction.
    pub dirty_writebacks: u64,
    /// Number of dirty pages written by explicit flushes.
    pub flushed_pages: u64,
}

/// Pinned, latched page buffers backed by a file.
///
/// Page allocation is not the cache's concern: writing an id past the end
/// of the file simply materialises a zeroed page that reaches disk on the
/// next flush.
pub trait PageCache: Send + Sync + 'static {
    /// Returns the page size in bytes.
    fn page_size(&self) -> usize;
    /// Number of pages currently backed by the file.
    fn page_count(&self) -> Result<u64>;
    /// Pins `id` and takes a shared latch on it.
    fn read(&self, id: PageId) -> Result<PageRef>;
    /// Pins `id`, takes an exclusive latch and marks the page dirty.
    fn write(&self, id: PageId) -> Result<PageMut>;
    /// Writes every dirty page, pacing through `limiter`; returns pages written.
    fn flush(&self, limiter: &dyn IoLimiter) -> Result<usize>;
    /// Writes one page if it is dirty.
    fn flush_page(&self, id: PageId) -> Result<()>;
    /// Makes previously written pages durable.
    fn sync(&self) -> Result<()>;
    /// Returns a snapshot of pager statistics.
    fn stats(&self) -> PagerStats;
}

/// An immutable, pinned reference to a page.
pub struct PageRef {
    /// Page identifier.
    pub id: PageId,
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
    _pin: PinGuard,
}

impl PageRef {
    /// Returns the page data as a byte slice.
    pub fn data(&self) -> &[u8] {
        &self.guard
    }
}

/// A mutable, pinned reference to a page.
pub struct PageMut {
    /// Page identifier.
    pub id: PageId,
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    dirty: Arc<AtomicBool>,
    _pin: PinGuard,
}

impl PageMut {
    /// Returns the page data as an immutable byte slice.
    pub fn data(&self) -> &[u8] {
        &self.guard
    }

    /// Returns the page data as a mutable byte slice.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

impl Drop for PageMut {
    fn drop(&mut self) {
        // A flush may have cleared the flag while this latch was held.
        self.dirty.store(true, AtomicOrdering::Release);
    }
}

struct PagerInner {
    frames: Vec<Frame>,
    page_table: HashMap<PageId, usize>,
    clock_hand: usize,
    stats: PagerStats,
}

/// File-backed [`PageCache`] with CLOCK eviction.
pub struct Pager {
    io: Arc<dyn FileIo>,
    page_size: usize,
    cache_pages: usize,
    flush_batch_pages: usize,
    inner: Mutex<PagerInner>,
}

type PinnedFrame = (Arc<RwLock<Box<[u8]>>>, Arc<AtomicBool>, PinGuard);

struct FlushTarget {
    id: PageId,
    buf: Arc<RwLock<Box<[u8]>>>,
    dirty: Arc<AtomicBool>,
    _pin: PinGuard,
}

impl Pager {
    /// Builds a pager over an already opened file.
    pub fn open(io: Arc<dyn FileIo>, options: &PagerOptions) -> Result<Self> {
        let page_size = options.page_size;
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(TreeError::Invalid(
                "page size must be a power of two between 1 KiB and 64 KiB",
            ));
        }
        if options.cache_pages < 8 {
            return Err(TreeError::Invalid("cache must hold at least 8 pages"));
        }
        debug!(
            target: "gbptree::pager",
            page_size,
            cache_pages = options.cache_pages,
            "pager opened"
        );
        Ok(Self {
            io,
            page_size: page_size as usize,
            cache_pages: options.cache_pages,
            flush_batch_pages: options.flush_batch_pages.max(1),
            inner: Mutex::new(PagerInner {
                frames: Vec::new(),
                page_table: HashMap::new(),
                clock_hand: 0,
                stats: PagerStats::default(),
            }),
        })
    }

    /// Opens or creates the file at `path` and builds a pager over it.
    pub fn open_path(path: impl AsRef<Path>, options: &PagerOptions) -> Result<Self> {
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path)?);
        Self::open(io, options)
    }

    fn offset(&self, id: PageId) -> Result<u64> {
        id.0.checked_mul(self.page_size as u64)
            .ok_or(TreeError::Invalid("page offset overflow"))
    }

    fn load_into(&self, id: PageId, dst: &mut [u8]) -> Result<()> {
        let off = self.offset(id)?;
        let len = self.io.len()?;
        dst.fill(0);
        if off >= len {
            return Ok(());
        }
        let available = ((len - off) as usize).min(dst.len());
        self.io.read_at(off, &mut dst[..available])
    }

    fn write_back(&self, id: PageId, buf: &[u8]) -> Result<()> {
        let off = self.offset(id)?;
        trace!(target: "gbptree::pager", page = id.0, "write back");
        self.io.write_at(off, buf)
    }

    fn lookup_or_load(&self, inner: &mut PagerInner, id: PageId) -> Result<usize> {
        if let Some(&idx) = inner.page_table.get(&id) {
            inner.stats.hits += 1;
            return Ok(idx);
        }
        inner.stats.misses += 1;
        let idx = self.free_frame(inner)?;
        let frame = &mut inner.frames[idx];
        {
            // Unpinned, so no latch can be outstanding on this buffer.
            let mut buf = frame.buf.write();
            self.load_into(id, &mut buf)?;
        }
        frame.id = Some(id);
        frame.reference = true;
        frame.dirty.store(false, AtomicOrdering::Release);
        inner.page_table.insert(id, idx);
        Ok(idx)
    }

    fn free_frame(&self, inner: &mut PagerInner) -> Result<usize> {
        if let Some(idx) = inner.frames.iter().position(|f| f.id.is_none() && !f.is_pinned()) {
            return Ok(idx);
        }
        if inner.frames.len() < self.cache_pages {
            inner.frames.push(Frame::new(self.page_size));
            return Ok(inner.frames.len() - 1);
        }
        self.run_clock(inner)
    }

    fn run_clock(&self, inner: &mut PagerInner) -> Result<usize> {
        let len = inner.frames.len();
        for _ in 0..len * 2 {
            let idx = inner.clock_hand;
            inner.clock_hand = (inner.clock_hand + 1) % len;
            let frame = &mut inner.frames[idx];
            if frame.is_pinned() {
                continue;
            }
            if frame.reference {
                frame.reference = false;
                continue;
            }
            self.evict_frame(inner, idx)?;
            return Ok(idx);
        }
        Err(TreeError::Invalid("page cache exhausted: every frame is pinned"))
    }

    /// Evicts a frame from the cache, writing it back if dirty.
    fn evict_frame(&self, inner: &mut PagerInner, idx: usize) -> Result<()> {
        let frame = &inner.frames[idx];
        if let Some(id) = frame.id {
            if frame.dirty.swap(false, AtomicOrdering::AcqRel) {
                let written = {
                    let buf = frame.buf.read();
                    self.write_back(id, &buf)
                };
                if let Err(err) = written {
                    frame.dirty.store(true, AtomicOrdering::Release);
                    return Err(err);
                }
                inner.stats.dirty_writebacks += 1;
            }
            inner.page_table.remove(&id);
            inner.stats.evictions += 1;
        }
        let frame = &mut inner.frames[idx];
        frame.id = None;
        frame.reference = false;
        Ok(())
    }

    fn pin(&self, id: PageId) -> Result<PinnedFrame> {
        let mut inner = self.inner.lock();
        let idx = self.lookup_or_load(&mut inner, id)?;
        let frame = &mut inner.frames[idx];
        frame.reference = true;
        let pin = PinGuard::acquire(&frame.pins);
        Ok((Arc::clone(&frame.buf), Arc::clone(&frame.dirty), pin))
    }

    fn write_targets(&self, targets: &[FlushTarget]) -> Result<usize> {
        let mut written = 0;
        for target in targets {
            if !target.dirty.swap(false, AtomicOrdering::AcqRel) {
                continue;
            }
            let result = {
                let buf = target.buf.read();
                self.write_back(target.id, &buf)
            };
            if let Err(err) = result {
                target.dirty.store(true, AtomicOrdering::Release);
                return Err(err);
            }
            written += 1;
        }
        Ok(written)
    }
}

impl PageCache for Pager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> Result<u64> {
        let len = self.io.len()?;
        Ok(len.div_ceil(self.page_size as u64))
    }

    fn read(&self, id: PageId) -> Result<PageRef> {
        let (buf, _dirty, pin) = self.pin(id)?;
        let guard = buf.read_arc();
        Ok(PageRef {
            id,
            guard,
            _pin: pin,
        })
    }

    fn write(&self, id: PageId) -> Result<PageMut> {
        let (buf, dirty, pin) = self.pin(id)?;
        let guard = buf.write_arc();
        dirty.store(true, AtomicOrdering::Release);
        Ok(PageMut {
            id,
            guard,
            dirty,
            _pin: pin,
        })
    }

    fn flush(&self, limiter: &dyn IoLimiter) -> Result<usize> {
        let mut targets: Vec<FlushTarget> = {
            let inner = self.inner.lock();
            inner
                .frames
                .iter()
                .filter(|frame| frame.is_dirty())
                .filter_map(|frame| {
                    frame.id.map(|id| FlushTarget {
                        id,
                        buf: Arc::clone(&frame.buf),
                        dirty: Arc::clone(&frame.dirty),
                        _pin: PinGuard::acquire(&frame.pins),
                    })
                })
                .collect()
        };
        targets.sort_by_key(|target| target.id);
        let mut total = 0;
        for batch in targets.chunks(self.flush_batch_pages) {
            let written = self.write_targets(batch)?;
            total += written;
            if written > 0 {
                limiter.pace(written);
            }
        }
        self.inner.lock().stats.flushed_pages += total as u64;
        debug!(target: "gbptree::pager", pages = total, "flushed dirty pages");
        Ok(total)
    }

    fn flush_page(&self, id: PageId) -> Result<()> {
        let target = {
            let inner = self.inner.lock();
            match inner.page_table.get(&id) {
                Some(&idx) => {
                    let frame = &inner.frames[idx];
                    FlushTarget {
                        id,
                        buf: Arc::clone(&frame.buf),
                        dirty: Arc::clone(&frame.dirty),
                        _pin: PinGuard::acquire(&frame.pins),
                    }
                }
                None => return Ok(()),
            }
        };
        let written = self.write_targets(std::slice::from_ref(&target))?;
        self.inner.lock().stats.flushed_pages += written as u64;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    fn stats(&self) -> PagerStats {
        self.inner.lock().stats.clone()
    }
}
