//! The tree and the key/value layouts it stores.

/// Generation-based B+ tree.
pub mod btree;

/// Pluggable key/value encodings.
pub mod layout;

pub use btree::{ConsistencyReport, Cursor, CursorState, GbpTree, Hit, TreeOptions, Writer};
pub use layout::{layout_identifier, BytesLayout, Layout, U64Layout};
