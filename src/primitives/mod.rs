//! Low-level primitives for building the tree.
//!
//! Includes byte utilities, I/O operations, the single-writer flag and the
//! page cache.

/// Byte-level utilities and encoding/decoding.
pub mod bytes;

/// Concurrency primitives and synchronization.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Paging subsystem: pinned page buffers and flush pacing.
pub mod pager;
