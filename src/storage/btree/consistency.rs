//! Offline structural validation.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::info;

use super::navigator::Fetched;
use super::page::{Node, NodeKind};
use super::pointer::GenPointer;
use super::tree::{GbpTree, TreeInner, TreeState};
use crate::storage::layout::Layout;
use crate::types::{Invariant, PageId, Result, TreeError};

/// Summary produced by a successful consistency check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    /// Number of levels, leaves included.
    pub height: usize,
    /// Internal nodes visited.
    pub internal_nodes: usize,
    /// Leaves visited.
    pub leaf_nodes: usize,
    /// Keys stored in leaves.
    pub keys: usize,
    /// Pages on the free list, reusable or waiting for a checkpoint.
    pub free_pages: usize,
    /// Generation of the last checkpoint.
    pub stable_generation: u64,
    /// Generation stamped on pages written now.
    pub unstable_generation: u64,
}

/// A pointer queued for the next level plus the key range it must cover.
struct Pending {
    ptr: GenPointer,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    parent_generation: u64,
}

impl<L: Layout> GbpTree<L> {
    /// Validates the whole tree breadth-first and fails on the first broken
    /// rule. Requires that no writer is open.
    pub fn consistency_check(&self) -> Result<ConsistencyReport> {
        let inner = self.inner();
        let _guard = inner
            .writer_slot
            .try_acquire()
            .ok_or(TreeError::Usage("consistency check while a writer is open"))?;
        let report = inner.check_tree()?;
        info!(
            target: "gbptree::consistency",
            height = report.height,
            keys = report.keys,
            free_pages = report.free_pages,
            "consistency check passed"
        );
        Ok(report)
    }
}

impl<L: Layout> TreeInner<L> {
    fn check_tree(&self) -> Result<ConsistencyReport> {
        let state = self.snapshot();
        let (next_page, free_pages, chain_pages) = {
            let free = self.free.lock();
            (
                free.next_page(),
                free.free_pages().collect::<Vec<_>>(),
                free.chain_pages().to_vec(),
            )
        };
        let mut report = ConsistencyReport {
            stable_generation: state.stable,
            unstable_generation: state.unstable,
            free_pages: free_pages.len(),
            ..ConsistencyReport::default()
        };

        let mut reachable = HashSet::new();
        let mut level = vec![Pending {
            ptr: state.root,
            lower: None,
            upper: None,
            parent_generation: u64::MAX,
        }];
        while !level.is_empty() {
            report.height += 1;
            let mut nodes: Vec<Node> = Vec::with_capacity(level.len());
            let mut next = Vec::new();
            let mut level_kind = None;
            for pending in level {
                let node = self.check_node(&pending, &state, next_page, &mut reachable)?;
                let page = pending.ptr.page;
                match level_kind {
                    None => level_kind = Some(node.kind),
                    Some(kind) if kind != node.kind => {
                        return Err(TreeError::inconsistent(
                            page,
                            Invariant::NodeKind,
                            format!("{:?} node on a level of {:?} nodes", node.kind, kind),
                        ))
                    }
                    Some(_) => {}
                }
                match node.kind {
                    NodeKind::Leaf => {
                        report.leaf_nodes += 1;
                        report.keys += node.keys.len();
                    }
                    NodeKind::Internal => {
                        report.internal_nodes += 1;
                        let last = node.children.len() - 1;
                        for (idx, child) in node.children.iter().enumerate() {
                            next.push(Pending {
                                ptr: *child,
                                lower: if idx == 0 {
                                    pending.lower.clone()
                                } else {
                                    Some(node.keys[idx - 1].clone())
                                },
                                upper: if idx == last {
                                    pending.upper.clone()
                                } else {
                                    Some(node.keys[idx].clone())
                                },
                                parent_generation: node.generation,
                            });
                        }
                    }
                }
                nodes.push(node);
            }
            check_sibling_chain(&nodes)?;
            level = next;
        }

        check_accounting(next_page, &reachable, &free_pages, &chain_pages)?;
        Ok(report)
    }

    fn check_node(
        &self,
        pending: &Pending,
        state: &TreeState,
        next_page: u64,
        reachable: &mut HashSet<PageId>,
    ) -> Result<Node> {
        let ptr = pending.ptr;
        if ptr.is_null() || ptr.page.0 >= next_page {
            return Err(TreeError::inconsistent(
                ptr.page,
                Invariant::ChildPointer,
                format!("pointer outside the allocated range [1, {next_page})"),
            ));
        }
        if !reachable.insert(ptr.page) {
            return Err(TreeError::inconsistent(
                ptr.page,
                Invariant::PageAliasing,
                "page is reachable more than once",
            ));
        }
        let node = match self.fetch(ptr) {
            Ok(Fetched::Node(node)) => node,
            Ok(Fetched::Stale) => {
                return Err(TreeError::inconsistent(
                    ptr.page,
                    Invariant::ChildPointer,
                    format!(
                        "pointer expects a node of generation {}",
                        ptr.generation
                    ),
                ))
            }
            Err(TreeError::Corruption(what)) => {
                return Err(TreeError::inconsistent(ptr.page, Invariant::ChildPointer, what))
            }
            Err(err) => return Err(err),
        };

        let generation = node.generation;
        if generation > state.unstable
            || (generation != state.unstable && generation > state.stable)
        {
            return Err(TreeError::inconsistent(
                ptr.page,
                Invariant::GenerationOrder,
                format!(
                    "generation {generation} outside stable {} / unstable {}",
                    state.stable, state.unstable
                ),
            ));
        }
        if generation > pending.parent_generation {
            return Err(TreeError::inconsistent(
                ptr.page,
                Invariant::GenerationOrder,
                format!(
                    "generation {generation} newer than parent generation {}",
                    pending.parent_generation
                ),
            ));
        }
        if node.kind == NodeKind::Internal && node.children.len() != node.keys.len() + 1 {
            return Err(TreeError::inconsistent(
                ptr.page,
                Invariant::ChildPointer,
                "internal node child count does not match its keys",
            ));
        }

        let cmp = |a: &[u8], b: &[u8]| self.layout.compare(a, b);
        for pair in node.keys.windows(2) {
            if cmp(&pair[0], &pair[1]).is_ge() {
                return Err(TreeError::inconsistent(
                    ptr.page,
                    Invariant::KeyOrder,
                    "keys are not strictly ascending",
                ));
            }
        }
        if let (Some(lower), Some(first)) = (&pending.lower, node.first_key()) {
            if cmp(first, lower).is_lt() {
                return Err(TreeError::inconsistent(
                    ptr.page,
                    Invariant::SeparatorBounds,
                    "key below the parent's lower separator",
                ));
            }
        }
        if let (Some(upper), Some(last)) = (&pending.upper, node.last_key()) {
            if cmp(last, upper).is_ge() {
                return Err(TreeError::inconsistent(
                    ptr.page,
                    Invariant::SeparatorBounds,
                    "key at or above the parent's upper separator",
                ));
            }
        }
        Ok(node)
    }
}

fn check_sibling_chain(nodes: &[Node]) -> Result<()> {
    for (idx, node) in nodes.iter().enumerate() {
        let page = node.page.unwrap_or_default();
        if !node.links_visible {
            return Err(TreeError::inconsistent(
                page,
                Invariant::SiblingChain,
                "sibling pair has no visible slot",
            ));
        }
        let expected_left = match idx {
            0 => GenPointer::NULL,
            _ => nodes[idx - 1].pointer(),
        };
        let expected_right = nodes
            .get(idx + 1)
            .map(Node::pointer)
            .unwrap_or(GenPointer::NULL);
        if node.left != expected_left {
            return Err(TreeError::inconsistent(
                page,
                Invariant::SiblingChain,
                format!(
                    "left sibling is page {} gen {}, expected page {} gen {}",
                    node.left.page, node.left.generation, expected_left.page, expected_left.generation
                ),
            ));
        }
        if node.right != expected_right {
            return Err(TreeError::inconsistent(
                page,
                Invariant::SiblingChain,
                format!(
                    "right sibling is page {} gen {}, expected page {} gen {}",
                    node.right.page,
                    node.right.generation,
                    expected_right.page,
                    expected_right.generation
                ),
            ));
        }
    }
    Ok(())
}

/// Every page in `[1, next_page)` must have exactly one role.
fn check_accounting(
    next_page: u64,
    reachable: &HashSet<PageId>,
    free_pages: &[PageId],
    chain_pages: &[PageId],
) -> Result<()> {
    let mut owners: HashMap<PageId, &'static str> =
        reachable.iter().map(|id| (*id, "reachable")).collect();
    let others = free_pages
        .iter()
        .map(|id| (*id, "free"))
        .chain(chain_pages.iter().map(|id| (*id, "free-list chain")));
    for (id, role) in others {
        if let Some(previous) = owners.insert(id, role) {
            return Err(TreeError::inconsistent(
                id,
                Invariant::PageAliasing,
                format!("page is both {previous} and {role}"),
            ));
        }
    }
    for raw in 1..next_page {
        if !owners.contains_key(&PageId(raw)) {
            return Err(TreeError::inconsistent(
                PageId(raw),
                Invariant::LeakedPage,
                "page is neither reachable nor free",
            ));
        }
    }
    Ok(())
}
