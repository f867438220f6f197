//! Persistent ordered key/value index built as a generation-based
//! copy-on-write B+ tree.
//!
//! A tree lives in one paged file. Any number of [`Cursor`]s may scan it while
//! a single [`Writer`] mutates it; [`GbpTree::checkpoint`] makes the writer's
//! changes durable by flushing pages and flipping one of two checkpoint
//! records. A crash at any point reopens to the last completed checkpoint.
//!
//! ```no_run
//! use gbptree::{GbpTree, TreeOptions, U64Layout, Unlimited};
//!
//! # fn main() -> gbptree::Result<()> {
//! let tree = GbpTree::open_path("index.gbpt", U64Layout::fixed(), TreeOptions::default())?;
//! let mut writer = tree.writer()?;
//! writer.put(&7, &14)?;
//! writer.close();
//! tree.checkpoint(&Unlimited)?;
//!
//! let mut cursor = tree.seek(&0, &100)?;
//! while cursor.next()? {
//!     let hit = cursor.get().expect("positioned");
//!     println!("{} -> {}", hit.key(), hit.value());
//! }
//! tree.close()?;
//! # Ok(())
//! # }
//! ```

pub mod primitives;
pub mod storage;
pub mod types;

pub use primitives::io::{FaultyFileIo, FileIo, StdFileIo};
pub use primitives::pager::{
    IoLimiter, PageCache, PageMut, PageRef, Pager, PagerOptions, PagerStats, RateLimiter,
    Unlimited,
};
pub use storage::btree::{
    ConsistencyReport, Cursor, CursorState, GbpTree, Hit, TreeOptions, TreeStats,
    TreeStatsSnapshot, Writer,
};
pub use storage::layout::{layout_identifier, BytesLayout, Layout, U64Layout};
pub use types::{Invariant, PageId, Result, TreeError};
