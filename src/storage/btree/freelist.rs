//! Generation-tagged page allocation.
//!
//! A page released in generation `g` may still be referenced by readers of
//! generation `g - 1` and by the stable checkpoint, so it only becomes
//! reusable once `g` itself is stable. Releases of the running generation
//! wait in `pending` until the next checkpoint promotes them.
//!
//! The list is persisted at checkpoint time as a chain of free-list pages:
//!
//! ```text
//! 0..32   common page header (kind FreeList)
//! 32..40  next chain page (0 terminates)
//! 40..44  entry count
//! 44..48  reserved
//! 48..    (page u64, freed generation u64) entries
//! ```

use tracing::debug;

use crate::primitives::bytes::{get_u32, get_u64, put_u32, put_u64};
use crate::primitives::pager::PageCache;
use crate::types::{
    page::{clear_crc32, PageHeader, PageKind},
    page_crc32, PageId, Result, TreeError,
};

const NEXT: usize = 32;
const COUNT: usize = 40;
const ENTRIES: usize = 48;
const ENTRY_LEN: usize = 16;

/// Entries that fit on one chain page.
pub(crate) fn entries_per_page(page_size: usize) -> usize {
    (page_size - ENTRIES) / ENTRY_LEN
}

#[derive(Debug, Default)]
pub(crate) struct FreeList {
    /// Released in a generation that is now stable.
    reusable: Vec<(PageId, u64)>,
    /// Released in the running generation.
    pending: Vec<(PageId, u64)>,
    /// Pages holding the list persisted by the last checkpoint.
    chain: Vec<PageId>,
    /// Chain written by a checkpoint whose record is not durable yet.
    staged_chain: Vec<PageId>,
    next_page: u64,
}

impl FreeList {
    /// Empty list for a freshly created file.
    pub(crate) fn new(next_page: u64) -> Self {
        Self {
            next_page,
            ..Self::default()
        }
    }

    /// Reads the chain starting at `head`.
    pub(crate) fn load(
        cache: &dyn PageCache,
        head: PageId,
        next_page: u64,
        salt: u64,
        stable: u64,
    ) -> Result<Self> {
        let mut list = Self::new(next_page);
        let mut cursor = head;
        while cursor.0 != 0 {
            if cursor.0 >= next_page || list.chain.contains(&cursor) {
                return Err(TreeError::Corruption("free-list chain is malformed"));
            }
            let page = cache.read(cursor)?;
            let (next, entries) = decode_chain_page(page.data(), cursor, salt)?;
            drop(page);
            for (id, generation) in entries {
                if generation <= stable {
                    list.reusable.push((id, generation));
                } else {
                    list.pending.push((id, generation));
                }
            }
            list.chain.push(cursor);
            cursor = next;
        }
        debug!(
            target: "gbptree::freelist",
            chain_pages = list.chain.len(),
            free_pages = list.free_count(),
            "loaded free list"
        );
        Ok(list)
    }

    /// Hands out a page id. Reused pages were freed in a stable generation.
    pub(crate) fn allocate(&mut self) -> PageId {
        match self.reusable.pop() {
            Some((id, _)) => id,
            None => {
                let id = PageId(self.next_page);
                self.next_page += 1;
                id
            }
        }
    }

    /// Records that `id` stopped being referenced in generation `unstable`.
    pub(crate) fn release(&mut self, id: PageId, unstable: u64) {
        self.pending.push((id, unstable));
    }

    pub(crate) fn next_page(&self) -> u64 {
        self.next_page
    }

    pub(crate) fn free_count(&self) -> usize {
        self.reusable.len() + self.pending.len()
    }

    /// Every free page id, reusable or pending.
    pub(crate) fn free_pages(&self) -> impl Iterator<Item = PageId> + '_ {
        self.reusable
            .iter()
            .chain(self.pending.iter())
            .map(|(id, _)| *id)
    }

    /// Pages of the persisted chain.
    pub(crate) fn chain_pages(&self) -> &[PageId] {
        &self.chain
    }

    /// Writes the list into a new chain and returns its head.
    ///
    /// The previous chain stays untouched: its pages are recorded as freed in
    /// `unstable` and only become reusable after [`FreeList::promote`].
    pub(crate) fn persist(
        &mut self,
        cache: &dyn PageCache,
        salt: u64,
        unstable: u64,
    ) -> Result<PageId> {
        let per_page = entries_per_page(cache.page_size());
        let mut staged = Vec::new();
        loop {
            let count = self.reusable.len() + self.pending.len() + self.chain.len();
            if staged.len() >= count.div_ceil(per_page) {
                break;
            }
            staged.push(self.allocate());
        }

        let entries: Vec<(PageId, u64)> = self
            .reusable
            .iter()
            .chain(self.pending.iter())
            .copied()
            .chain(self.chain.iter().map(|id| (*id, unstable)))
            .collect();
        let mut chunks = entries.chunks(per_page);
        for (idx, id) in staged.iter().enumerate() {
            let next = staged.get(idx + 1).copied().unwrap_or_default();
            let chunk = chunks.next().unwrap_or(&[]);
            let mut page = cache.write(*id)?;
            encode_chain_page(page.data_mut(), *id, next, chunk, salt)?;
        }
        let head = staged.first().copied().unwrap_or_default();
        self.staged_chain = staged;
        Ok(head)
    }

    /// Called once the checkpoint record naming the staged chain is durable.
    pub(crate) fn promote(&mut self, new_stable: u64) {
        let previous = std::mem::take(&mut self.chain);
        self.reusable
            .extend(previous.into_iter().map(|id| (id, new_stable)));
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(_, generation)| *generation <= new_stable);
        self.reusable.extend(ready);
        self.pending = waiting;
        self.chain = std::mem::take(&mut self.staged_chain);
    }
}

fn encode_chain_page(
    buf: &mut [u8],
    id: PageId,
    next: PageId,
    entries: &[(PageId, u64)],
    salt: u64,
) -> Result<()> {
    buf.fill(0);
    PageHeader::new(id, PageKind::FreeList, buf.len() as u32, salt)?.encode(buf)?;
    put_u64(buf, NEXT, next.0);
    put_u32(buf, COUNT, entries.len() as u32);
    for (idx, (page, generation)) in entries.iter().enumerate() {
        let at = ENTRIES + idx * ENTRY_LEN;
        put_u64(buf, at, page.0);
        put_u64(buf, at + 8, *generation);
    }
    clear_crc32(buf)?;
    let crc = page_crc32(id.0, salt, buf);
    put_u32(buf, crate::types::page::header::CRC32.start, crc);
    Ok(())
}

fn decode_chain_page(buf: &[u8], id: PageId, salt: u64) -> Result<(PageId, Vec<(PageId, u64)>)> {
    let header = PageHeader::decode(buf)?;
    if header.kind != PageKind::FreeList || header.page_no != id || header.salt != salt {
        return Err(TreeError::Corruption("free-list page header mismatch"));
    }
    let mut scratch = buf.to_vec();
    clear_crc32(&mut scratch)?;
    if page_crc32(id.0, salt, &scratch) != header.crc32 {
        return Err(TreeError::Corruption("free-list page checksum mismatch"));
    }
    let count = get_u32(buf, COUNT) as usize;
    if count > entries_per_page(buf.len()) {
        return Err(TreeError::Corruption("free-list page entry count out of range"));
    }
    let entries = (0..count)
        .map(|idx| {
            let at = ENTRIES + idx * ENTRY_LEN;
            (PageId(get_u64(buf, at)), get_u64(buf, at + 8))
        })
        .collect();
    Ok((PageId(get_u64(buf, NEXT)), entries))
}
