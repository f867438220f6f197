//! Single-writer mutations with copy-on-write.
//!
//! Every operation rebuilds the modified leaf in memory and then walks the
//! recorded path upward. At each level the touched nodes form a run: one node,
//! a node plus the pieces it split into, or a node plus the sibling it merged
//! or rebalanced with. A run is committed bottom-up; nodes from an older
//! generation get a fresh page, which forces their parent to be rewritten in
//! turn. Propagation stops at the first parent whose child pointers did not
//! change. The new root is published only after every page write is done.

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use tracing::{debug, warn};

use super::navigator::Path;
use super::page::{capacity, max_entry_len, raw_generation, raw_node_kind, Node, NodeKind, Side};
use super::pointer::{self, GenPointer};
use super::tree::TreeInner;
use crate::primitives::concurrency::WriterGuard;
use crate::storage::layout::Layout;
use crate::types::{Invariant, Result, TreeError};

/// Exclusive mutation session.
///
/// Changes are visible to readers as soon as each call returns, and durable
/// only after the next checkpoint.
pub struct Writer<L: Layout> {
    inner: Arc<TreeInner<L>>,
    _guard: WriterGuard,
}

/// Replacement for `replaced` consecutive children of a parent, starting at
/// `first_slot`.
struct Edit {
    first_slot: usize,
    replaced: usize,
    nodes: Vec<Node>,
    separators: Vec<Vec<u8>>,
    left_outer: GenPointer,
    right_outer: GenPointer,
    /// Every node needs a fresh page, even one already written in `U`.
    relocate: bool,
}

impl<L: Layout> Writer<L> {
    pub(crate) fn new(inner: Arc<TreeInner<L>>, guard: WriterGuard) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }

    /// Inserts `key`, replacing the value if it is already present.
    pub fn put(&mut self, key: &L::Key, value: &L::Value) -> Result<()> {
        self.inner.ensure_healthy()?;
        let mut key_buf = Vec::new();
        self.inner.layout.write_key(key, &mut key_buf);
        let mut value_buf = Vec::new();
        self.inner.layout.write_value(value, &mut value_buf);
        self.inner.check_entry(&key_buf, &value_buf)?;
        let result = self.inner.put_encoded(key_buf, value_buf);
        self.inner.fail_on_error(result)
    }

    /// Removes `key`, returning its previous value.
    pub fn remove(&mut self, key: &L::Key) -> Result<Option<L::Value>> {
        self.inner.ensure_healthy()?;
        let key_buf = self.inner.encode_key(key);
        let result = self.inner.remove_encoded(&key_buf);
        match self.inner.fail_on_error(result)? {
            Some(value) => Ok(Some(self.inner.layout.read_value(&value)?)),
            None => Ok(None),
        }
    }

    /// Ends the session and lets another writer open.
    pub fn close(self) {}
}

impl<L: Layout> TreeInner<L> {
    fn check_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.format.key_size.is_some_and(|size| size != key.len()) {
            return Err(TreeError::Invalid("key length differs from the layout key size"));
        }
        if self.format.value_size.is_some_and(|size| size != value.len()) {
            return Err(TreeError::Invalid(
                "value length differs from the layout value size",
            ));
        }
        let len = self.format.key_len(key) + self.format.value_len(value);
        if len > max_entry_len(self.page_size) {
            return Err(TreeError::Invalid(
                "entry larger than a quarter of the node capacity",
            ));
        }
        Ok(())
    }

    fn fail_on_error<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.failed.store(true, AtomicOrdering::Release);
            warn!(target: "gbptree::writer", error = %err, "mutation failed; tree handle disabled");
        }
        result
    }

    fn put_encoded(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let descent = self.descend(&key)?;
        let mut leaf = descent.leaf;
        match leaf.search(&key, |a, b| self.layout.compare(a, b)) {
            Ok(idx) => leaf.values[idx] = value,
            Err(idx) => {
                leaf.keys.insert(idx, key);
                leaf.values.insert(idx, value);
            }
        }
        self.apply(descent.path, leaf)
    }

    fn remove_encoded(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let descent = self.descend(key)?;
        let mut leaf = descent.leaf;
        match leaf.search(key, |a, b| self.layout.compare(a, b)) {
            Ok(idx) => {
                leaf.keys.remove(idx);
                let value = leaf.values.remove(idx);
                self.apply(descent.path, leaf)?;
                Ok(Some(value))
            }
            Err(_) => Ok(None),
        }
    }

    fn is_underflowing(&self, node: &Node) -> bool {
        node.payload_len(&self.format) < capacity(self.page_size) / 4
    }

    /// Commits a modified node and propagates the change up `path`.
    fn apply(&self, mut path: Path, node: Node) -> Result<()> {
        self.modified.store(true, AtomicOrdering::Release);
        let mut current = node;
        while let Some(entry) = path.pop() {
            let mut parent = self.fetch_strict(entry.pointer)?;
            let slot = entry.child_index;
            if slot >= parent.children.len() {
                return Err(TreeError::inconsistent(
                    entry.pointer.page,
                    Invariant::ChildPointer,
                    "descent path points past the last child",
                ));
            }
            let edit = self.plan_edit(&parent, slot, current)?;
            let Edit {
                first_slot,
                replaced,
                nodes,
                separators,
                left_outer,
                right_outer,
                relocate,
            } = edit;
            let written = self.commit_run(nodes, left_outer, right_outer, relocate)?;
            if replaced == 1 && written.len() == 1 && written[0] == parent.children[first_slot] {
                return Ok(());
            }
            parent
                .children
                .splice(first_slot..first_slot + replaced, written);
            parent
                .keys
                .splice(first_slot..first_slot + replaced - 1, separators);
            current = parent;
        }
        self.apply_root(current)
    }

    /// Decides how a modified child is written back under `parent`.
    fn plan_edit(&self, parent: &Node, slot: usize, node: Node) -> Result<Edit> {
        if self.is_underflowing(&node) && parent.children.len() > 1 {
            let (first_slot, mut left, right) = if slot + 1 < parent.children.len() {
                let right = self.fetch_strict(parent.children[slot + 1])?;
                (slot, node, right)
            } else {
                let left = self.fetch_strict(parent.children[slot - 1])?;
                (slot - 1, left, node)
            };
            let left_outer = left.left;
            let right_outer = right.right;
            let separator = parent.keys[first_slot].clone();
            let right_page = right.page;
            let right_generation = right.generation;
            let combined = left.payload_len(&self.format)
                + right.payload_len(&self.format)
                + match left.kind {
                    NodeKind::Internal => self.format.key_len(&separator),
                    NodeKind::Leaf => 0,
                };
            left.absorb(separator, right);

            if combined <= capacity(self.page_size) {
                if let Some(page) = right_page {
                    self.free.lock().release(page, self.state.read().unstable);
                }
                self.stats.inc_merges();
                return Ok(Edit {
                    first_slot,
                    replaced: 2,
                    nodes: vec![left],
                    separators: Vec::new(),
                    left_outer,
                    right_outer,
                    relocate: false,
                });
            }

            let (separator, mut right) = left.split(&self.format)?;
            right.page = right_page;
            right.generation = right_generation;
            self.stats.inc_rebalances();
            let (mut nodes, mut separators) = self.split_to_fit(left)?;
            let (tail, tail_separators) = self.split_to_fit(right)?;
            separators.push(separator);
            nodes.extend(tail);
            separators.extend(tail_separators);
            return Ok(Edit {
                first_slot,
                replaced: 2,
                nodes,
                separators,
                left_outer,
                right_outer,
                relocate: true,
            });
        }

        let left_outer = node.left;
        let right_outer = node.right;
        let (nodes, separators) = self.split_to_fit(node)?;
        Ok(Edit {
            first_slot: slot,
            replaced: 1,
            nodes,
            separators,
            left_outer,
            right_outer,
            relocate: false,
        })
    }

    /// Splits `node` at byte midpoints until every piece fits in a page.
    /// Only the first piece keeps the original page.
    fn split_to_fit(&self, node: Node) -> Result<(Vec<Node>, Vec<Vec<u8>>)> {
        let limit = capacity(self.page_size);
        let mut nodes = vec![node];
        let mut separators = Vec::new();
        let mut idx = 0;
        while idx < nodes.len() {
            if nodes[idx].payload_len(&self.format) <= limit {
                idx += 1;
                continue;
            }
            let (separator, right) = nodes[idx].split(&self.format)?;
            match right.kind {
                NodeKind::Leaf => self.stats.inc_leaf_splits(),
                NodeKind::Internal => self.stats.inc_internal_splits(),
            }
            nodes.insert(idx + 1, right);
            separators.insert(idx, separator);
        }
        Ok((nodes, separators))
    }

    /// Assigns pages, links siblings and writes a run of nodes, then points
    /// the outer neighbours at it. Returns the new child pointers.
    ///
    /// With `relocate` set, nodes that already own a page are moved to fresh
    /// ones so the old pages stay intact until the parent is rewritten.
    fn commit_run(
        &self,
        mut nodes: Vec<Node>,
        left_outer: GenPointer,
        right_outer: GenPointer,
        relocate: bool,
    ) -> Result<Vec<GenPointer>> {
        let unstable = self.state.read().unstable;
        {
            let mut free = self.free.lock();
            for node in nodes.iter_mut() {
                match node.page {
                    None => node.page = Some(free.allocate()),
                    Some(page) if node.generation < unstable => {
                        free.release(page, unstable);
                        node.page = Some(free.allocate());
                        self.stats.inc_cow_copies();
                    }
                    Some(page) if relocate => {
                        free.release(page, unstable);
                        node.page = Some(free.allocate());
                    }
                    Some(_) => {}
                }
                node.generation = unstable;
            }
        }

        let pointers: Vec<GenPointer> = nodes.iter().map(Node::pointer).collect();
        let last = nodes.len() - 1;
        for (idx, node) in nodes.iter_mut().enumerate() {
            node.left = if idx == 0 { left_outer } else { pointers[idx - 1] };
            node.right = if idx == last { right_outer } else { pointers[idx + 1] };
        }

        for node in nodes.iter().rev() {
            let Some(page_id) = node.page else {
                return Err(TreeError::Invalid("node has no page assigned"));
            };
            let mut page = self.cache.write(page_id)?;
            node.encode(page.data_mut(), &self.format, self.salt)?;
        }

        if !left_outer.is_null() {
            self.update_sibling(left_outer, Side::Right, pointers[0])?;
        }
        if !right_outer.is_null() {
            self.update_sibling(right_outer, Side::Left, pointers[last])?;
        }
        Ok(pointers)
    }

    /// Redirects one sibling pair of `target` in place.
    fn update_sibling(&self, target: GenPointer, side: Side, to: GenPointer) -> Result<()> {
        let state = self.snapshot();
        let current = {
            let page = self.cache.read(target.page)?;
            let buf = page.data();
            if raw_node_kind(buf).is_none() || raw_generation(buf) != target.generation {
                return Err(TreeError::inconsistent(
                    target.page,
                    Invariant::SiblingChain,
                    "sibling link points at a page of another generation",
                ));
            }
            pointer::read_pair(&buf[side.range()], state.stable, state.unstable)
        };
        if current == Some(to) {
            return Ok(());
        }
        let mut page = self.cache.write(target.page)?;
        pointer::write_pair(
            &mut page.data_mut()[side.range()],
            to,
            state.stable,
            state.unstable,
        );
        Ok(())
    }

    /// Writes the top of the tree: grows a level on overflow, drops one when
    /// an internal root is left with a single child.
    fn apply_root(&self, node: Node) -> Result<()> {
        let mut current = node;
        loop {
            if current.kind == NodeKind::Internal && current.keys.is_empty() {
                let child = current.children[0];
                if let Some(page) = current.page {
                    self.free.lock().release(page, self.state.read().unstable);
                }
                self.stats.inc_root_collapses();
                debug!(target: "gbptree::writer", root = child.page.0, "root collapsed");
                self.publish_root(child);
                return Ok(());
            }
            let (nodes, separators) = self.split_to_fit(current)?;
            let pointers = self.commit_run(nodes, GenPointer::NULL, GenPointer::NULL, false)?;
            if pointers.len() == 1 {
                self.publish_root(pointers[0]);
                return Ok(());
            }
            self.stats.inc_root_splits();
            debug!(target: "gbptree::writer", fanout = pointers.len(), "root split");
            current = Node::new_internal(pointers, separators);
        }
    }

    fn publish_root(&self, root: GenPointer) {
        self.state.write().root = root;
    }
}
