//! Root-to-leaf descent shared by readers and the writer.

use smallvec::SmallVec;
use tracing::debug;

use super::page::{raw_generation, raw_node_kind, Node};
use super::pointer::GenPointer;
use super::tree::{TreeInner, TreeState};
use crate::storage::layout::Layout;
use crate::types::{Invariant, Result, TreeError};

/// Outcome of reading the page a pointer refers to.
pub(crate) enum Fetched {
    Node(Node),
    /// The page was freed and reused, or never written in that generation.
    Stale,
}

/// One internal node on the way down.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PathEntry {
    pub pointer: GenPointer,
    /// Index of the child that was followed.
    pub child_index: usize,
}

pub(crate) type Path = SmallVec<[PathEntry; 8]>;

pub(crate) struct Descent {
    pub path: Path,
    pub leaf: Node,
}

impl<L: Layout> TreeInner<L> {
    /// Reads and decodes the node `ptr` refers to.
    ///
    /// Sibling pairs are resolved against the generations current after the
    /// page was latched, so a checkpoint racing with the read cannot hide a
    /// link that was valid when the page was written.
    pub(crate) fn fetch(&self, ptr: GenPointer) -> Result<Fetched> {
        if ptr.is_null() {
            return Ok(Fetched::Stale);
        }
        let page = self.cache.read(ptr.page)?;
        let buf = page.data();
        if raw_node_kind(buf).is_none() || raw_generation(buf) != ptr.generation {
            return Ok(Fetched::Stale);
        }
        let state = self.snapshot();
        let node = Node::decode(
            buf,
            ptr.page,
            &self.format,
            self.salt,
            state.stable,
            state.unstable,
        )?;
        Ok(Fetched::Node(node))
    }

    /// Like [`TreeInner::fetch`] but treats a stale page as a broken tree.
    /// Used by the writer, which never races with another mutator.
    pub(crate) fn fetch_strict(&self, ptr: GenPointer) -> Result<Node> {
        match self.fetch(ptr)? {
            Fetched::Node(node) => Ok(node),
            Fetched::Stale => Err(TreeError::inconsistent(
                ptr.page,
                Invariant::ChildPointer,
                format!("expected a node of generation {}", ptr.generation),
            )),
        }
    }

    /// Finds the leaf whose range contains `key`, restarting from a fresh
    /// snapshot whenever a stale page is reached.
    pub(crate) fn descend(&self, key: &[u8]) -> Result<Descent> {
        let retries = self.options.max_generation_chase_retries;
        let mut snapshot = self.snapshot();
        for attempt in 0..=retries {
            if let Some(descent) = self.try_descend(key, &snapshot)? {
                return Ok(descent);
            }
            self.stats.inc_generation_chases();
            debug!(
                target: "gbptree::navigator",
                attempt,
                root = snapshot.root.page.0,
                "stale page during descent; restarting from the root"
            );
            snapshot = self.snapshot();
        }
        Err(TreeError::inconsistent(
            snapshot.root.page,
            Invariant::GenerationChase,
            format!("gave up after {retries} restarts"),
        ))
    }

    fn try_descend(&self, key: &[u8], snapshot: &TreeState) -> Result<Option<Descent>> {
        let cmp = |a: &[u8], b: &[u8]| self.layout.compare(a, b);
        let mut path = Path::new();
        let mut ptr = snapshot.root;
        loop {
            let node = match self.fetch(ptr)? {
                Fetched::Node(node) => node,
                Fetched::Stale => return Ok(None),
            };
            let Some(node) = self.move_right(node, key)? else {
                return Ok(None);
            };
            if node.is_leaf() {
                return Ok(Some(Descent { path, leaf: node }));
            }
            let child_index = node.child_index(key, cmp);
            path.push(PathEntry {
                pointer: node.pointer(),
                child_index,
            });
            ptr = node.children[child_index];
        }
    }

    /// Follows right siblings while `key` belongs further right, which
    /// happens when a node split in place after its parent was read.
    fn move_right(&self, mut node: Node, key: &[u8]) -> Result<Option<Node>> {
        loop {
            let beyond = node
                .last_key()
                .is_some_and(|last| self.layout.compare(key, last).is_gt());
            if !beyond || node.right.is_null() {
                return Ok(Some(node));
            }
            let right = match self.fetch(node.right)? {
                Fetched::Node(right) => right,
                Fetched::Stale => return Ok(None),
            };
            let belongs = right
                .first_key()
                .is_some_and(|first| self.layout.compare(first, key).is_le());
            if !belongs {
                return Ok(Some(node));
            }
            node = right;
        }
    }
}
