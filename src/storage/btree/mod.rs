#![forbid(unsafe_code)]

//! Generation-based copy-on-write B+ tree.
//!
//! Nodes written since the last checkpoint carry the unstable generation and
//! are modified in place; older nodes are copied first. A checkpoint flushes
//! every dirty page and then flips the metadata record, which makes the
//! current generation stable in one step.

/// Node page format.
pub mod page;
/// Generation-tagged child and sibling pointers.
pub mod pointer;

mod checkpoint;
mod cleaner;
mod consistency;
mod cursor;
mod freelist;
mod meta;
mod navigator;
mod stats;
mod tree;
mod writer;

pub use consistency::ConsistencyReport;
pub use cursor::{Cursor, CursorState, Hit};
pub use page::NodeKind;
pub use pointer::GenPointer;
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use tree::{GbpTree, TreeOptions};
pub use writer::Writer;
