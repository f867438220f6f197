use std::collections::VecDeque;
use std::sync::Arc;

use super::navigator::Fetched;
use super::page::Node;
use super::pointer::GenPointer;
use super::tree::TreeInner;
use crate::storage::layout::Layout;
use crate::types::Result;

/// Lifecycle of a [`Cursor`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CursorState {
    /// Opened; `next` has not been called yet.
    Positioned,
    /// At least one entry has been returned.
    Advancing,
    /// No entries remain.
    Exhausted,
}

/// Entry the cursor is positioned on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hit<K, V> {
    key: K,
    value: V,
}

impl<K, V> Hit<K, V> {
    /// Decoded key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Decoded value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Splits the hit into its key and value.
    pub fn into_parts(self) -> (K, V) {
        (self.key, self.value)
    }
}

/// Forward range scan over `[from, to)`.
///
/// The cursor buffers the in-range entries of one leaf at a time and holds no
/// page between calls. When the next leaf turns out to be stale it descends
/// again from the root for the successor of the last returned key, so keys
/// come out strictly ascending even while a writer is active.
pub struct Cursor<L: Layout> {
    inner: Arc<TreeInner<L>>,
    from: Vec<u8>,
    to: Vec<u8>,
    state: CursorState,
    buffered: VecDeque<(Vec<u8>, Vec<u8>)>,
    right: GenPointer,
    /// A key `>= to` was seen; nothing further right can match.
    reached_end: bool,
    last_key: Option<Vec<u8>>,
    current: Option<Hit<L::Key, L::Value>>,
}

impl<L: Layout> Cursor<L> {
    pub(crate) fn open(inner: Arc<TreeInner<L>>, from: Vec<u8>, to: Vec<u8>) -> Result<Self> {
        let mut cursor = Self {
            inner,
            from,
            to,
            state: CursorState::Positioned,
            buffered: VecDeque::new(),
            right: GenPointer::NULL,
            reached_end: false,
            last_key: None,
            current: None,
        };
        if cursor.inner.layout.compare(&cursor.from, &cursor.to).is_ge() {
            cursor.state = CursorState::Exhausted;
            return Ok(cursor);
        }
        cursor.reposition()?;
        Ok(cursor)
    }

    /// Current state.
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Moves to the next entry. Returns `false` once the range is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<bool> {
        if self.state == CursorState::Exhausted {
            return Ok(false);
        }
        loop {
            if let Some((key, value)) = self.buffered.pop_front() {
                let hit = Hit {
                    key: self.inner.layout.read_key(&key)?,
                    value: self.inner.layout.read_value(&value)?,
                };
                self.last_key = Some(key);
                self.current = Some(hit);
                self.state = CursorState::Advancing;
                return Ok(true);
            }
            if self.reached_end || self.right.is_null() {
                self.current = None;
                self.state = CursorState::Exhausted;
                return Ok(false);
            }
            match self.inner.fetch(self.right)? {
                Fetched::Node(node) if node.is_leaf() && node.links_visible => self.load(node),
                _ => self.reposition()?,
            }
        }
    }

    /// Entry returned by the last successful [`Cursor::next`].
    pub fn get(&self) -> Option<&Hit<L::Key, L::Value>> {
        self.current.as_ref()
    }

    /// Releases the cursor.
    pub fn close(self) {}

    /// Descends to the leaf holding the successor of the last returned key.
    fn reposition(&mut self) -> Result<()> {
        let target = self.last_key.as_deref().unwrap_or(&self.from).to_vec();
        let descent = self.inner.descend(&target)?;
        self.load(descent.leaf);
        Ok(())
    }

    fn load(&mut self, leaf: Node) {
        let layout = &self.inner.layout;
        self.right = leaf.right;
        for (key, value) in leaf.keys.into_iter().zip(leaf.values) {
            if layout.compare(&key, &self.to).is_ge() {
                self.reached_end = true;
                break;
            }
            if layout.compare(&key, &self.from).is_lt() {
                continue;
            }
            if let Some(last) = &self.last_key {
                if layout.compare(&key, last).is_le() {
                    continue;
                }
            }
            self.buffered.push_back((key, value));
        }
    }
}

impl<L: Layout> Iterator for Cursor<L> {
    type Item = Result<(L::Key, L::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        match Cursor::next(self) {
            Ok(true) => self.current.take().map(|hit| Ok(hit.into_parts())),
            Ok(false) => None,
            Err(err) => {
                self.state = CursorState::Exhausted;
                Some(Err(err))
            }
        }
    }
}
