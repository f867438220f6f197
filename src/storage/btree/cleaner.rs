//! Removes sibling slots written by a session that crashed before its
//! checkpoint.
//!
//! Such slots carry a generation strictly between the stable and the current
//! unstable generation and are already ignored by readers. Clearing them keeps
//! every pair down to slots that some checkpoint can still see.

use std::collections::VecDeque;

use super::navigator::Fetched;
use super::page::{LEFT_SIBLING, RIGHT_SIBLING};
use super::pointer;
use super::tree::TreeInner;
use crate::storage::layout::Layout;
use crate::types::{Invariant, Result, TreeError};

impl<L: Layout> TreeInner<L> {
    /// Walks every node reachable from the root and clears crashed slots.
    /// Returns how many slots were zeroed.
    pub(crate) fn clean_crashed_pointers(&self) -> Result<usize> {
        let state = self.snapshot();
        let mut queue = VecDeque::from([state.root]);
        let mut cleared = 0;
        while let Some(ptr) = queue.pop_front() {
            let node = match self.fetch(ptr)? {
                Fetched::Node(node) => node,
                Fetched::Stale => {
                    return Err(TreeError::inconsistent(
                        ptr.page,
                        Invariant::ChildPointer,
                        "stable tree references a page of another generation",
                    ))
                }
            };
            queue.extend(node.children.iter().copied());

            let pending = {
                let page = self.cache.read(ptr.page)?;
                let mut right = [0u8; pointer::PAIR_LEN];
                let mut left = [0u8; pointer::PAIR_LEN];
                right.copy_from_slice(&page.data()[RIGHT_SIBLING]);
                left.copy_from_slice(&page.data()[LEFT_SIBLING]);
                pointer::clear_crashed(&mut right, state.stable, state.unstable)
                    + pointer::clear_crashed(&mut left, state.stable, state.unstable)
            };
            if pending == 0 {
                continue;
            }
            let mut page = self.cache.write(ptr.page)?;
            let buf = page.data_mut();
            cleared += pointer::clear_crashed(&mut buf[RIGHT_SIBLING], state.stable, state.unstable);
            cleared += pointer::clear_crashed(&mut buf[LEFT_SIBLING], state.stable, state.unstable);
        }
        Ok(cleared)
    }
}
