#![allow(missing_docs)]

use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use gbptree::{
    BytesLayout, GbpTree, IoLimiter, Layout, PageCache, PageId, PageMut, PageRef, Pager,
    PagerOptions, PagerStats, Result, TreeError, TreeOptions, U64Layout, Unlimited,
};
use tempfile::tempdir;

fn options(page_size: u32) -> TreeOptions {
    TreeOptions {
        pager: PagerOptions {
            page_size,
            cache_pages: 32,
            flush_batch_pages: 8,
        },
        ..TreeOptions::default()
    }
}

fn create(path: &Path) -> Result<()> {
    let tree = GbpTree::open_path(path, U64Layout::fixed(), options(1024))?;
    let mut writer = tree.writer()?;
    for key in 0..300u64 {
        writer.put(&key, &key)?;
    }
    writer.close();
    tree.checkpoint(&Unlimited)?;
    tree.close()
}

fn expect_mismatch<T>(result: Result<T>, field: &str) {
    match result {
        Err(TreeError::FormatMismatch(detail)) => {
            assert!(detail.contains(field), "expected {field} mismatch, got {detail}")
        }
        Err(other) => panic!("expected {field} mismatch, got {other:?}"),
        Ok(_) => panic!("expected {field} mismatch, open succeeded"),
    }
}

/// `U64Layout` that claims a newer layout version.
struct BumpedU64;

impl Layout for BumpedU64 {
    type Key = u64;
    type Value = u64;

    fn identifier(&self) -> u64 {
        U64Layout::fixed().identifier()
    }

    fn major_version(&self) -> u32 {
        U64Layout::fixed().major_version() + 1
    }

    fn minor_version(&self) -> u32 {
        0
    }

    fn key_size(&self) -> Option<usize> {
        Some(8)
    }

    fn value_size(&self) -> Option<usize> {
        Some(8)
    }

    fn write_key(&self, key: &u64, out: &mut Vec<u8>) {
        U64Layout::fixed().write_key(key, out)
    }

    fn read_key(&self, bytes: &[u8]) -> Result<u64> {
        U64Layout::fixed().read_key(bytes)
    }

    fn write_value(&self, value: &u64, out: &mut Vec<u8>) {
        U64Layout::fixed().write_value(value, out)
    }

    fn read_value(&self, bytes: &[u8]) -> Result<u64> {
        U64Layout::fixed().read_value(bytes)
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

#[test]
fn mismatched_layouts_are_rejected_without_touching_the_file() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("compat.gbpt");
    create(&path)?;
    let before = fs::read(&path)?;

    expect_mismatch(
        GbpTree::open_path(&path, U64Layout::dynamic(), options(1024)),
        "layout identifier",
    );
    expect_mismatch(
        GbpTree::open_path(&path, BytesLayout, options(1024)),
        "layout identifier",
    );
    expect_mismatch(
        GbpTree::open_path(&path, BumpedU64, options(1024)),
        "layout version",
    );
    expect_mismatch(
        GbpTree::open_path(&path, U64Layout::fixed(), options(2048)),
        "page size",
    );
    assert_eq!(fs::read(&path)?, before);

    let tree = GbpTree::open_path(&path, U64Layout::fixed(), options(1024))?;
    assert_eq!(tree.get(&299)?, Some(299));
    tree.close()
}

#[test]
fn unknown_format_version_is_reported() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("version.gbpt");
    create(&path)?;

    let mut bytes = fs::read(&path)?;
    bytes[4..6].copy_from_slice(&99u16.to_be_bytes());
    fs::write(&path, &bytes)?;

    expect_mismatch(
        GbpTree::open_path(&path, U64Layout::fixed(), options(1024)),
        "format version",
    );
    assert_eq!(fs::read(&path)?, bytes);
    Ok(())
}

#[test]
fn damaged_magic_is_corruption() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("magic.gbpt");
    create(&path)?;

    let mut bytes = fs::read(&path)?;
    bytes[0] ^= 0xFF;
    fs::write(&path, &bytes)?;

    let result = GbpTree::open_path(&path, U64Layout::fixed(), options(1024));
    assert!(matches!(result, Err(TreeError::Corruption(_))));
    Ok(())
}

#[test]
fn oversized_fixed_entries_are_refused() {
    struct Wide;

    impl Layout for Wide {
        type Key = Vec<u8>;
        type Value = Vec<u8>;

        fn identifier(&self) -> u64 {
            gbptree::layout_identifier("wide", Some(200), Some(200))
        }

        fn major_version(&self) -> u32 {
            0
        }

        fn minor_version(&self) -> u32 {
            0
        }

        fn key_size(&self) -> Option<usize> {
            Some(200)
        }

        fn value_size(&self) -> Option<usize> {
            Some(200)
        }

        fn write_key(&self, key: &Vec<u8>, out: &mut Vec<u8>) {
            out.extend_from_slice(key)
        }

        fn read_key(&self, bytes: &[u8]) -> Result<Vec<u8>> {
            Ok(bytes.to_vec())
        }

        fn write_value(&self, value: &Vec<u8>, out: &mut Vec<u8>) {
            out.extend_from_slice(value)
        }

        fn read_value(&self, bytes: &[u8]) -> Result<Vec<u8>> {
            Ok(bytes.to_vec())
        }

        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            a.cmp(b)
        }
    }

    let dir = tempdir().expect("tmpdir");
    let result = GbpTree::open_path(dir.path().join("wide.gbpt"), Wide, options(1024));
    assert!(matches!(result, Err(TreeError::Invalid(_))));
}

/// Cache that reports a page size other than the one it stores.
struct MisreportedCache {
    inner: Pager,
    page_size: usize,
}

impl PageCache for MisreportedCache {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> Result<u64> {
        self.inner.page_count()
    }

    fn read(&self, id: PageId) -> Result<PageRef> {
        self.inner.read(id)
    }

    fn write(&self, id: PageId) -> Result<PageMut> {
        self.inner.write(id)
    }

    fn flush(&self, limiter: &dyn IoLimiter) -> Result<usize> {
        self.inner.flush(limiter)
    }

    fn flush_page(&self, id: PageId) -> Result<()> {
        self.inner.flush_page(id)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn stats(&self) -> PagerStats {
        self.inner.stats()
    }
}

#[test]
fn caches_with_unsupported_page_sizes_are_refused() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    for page_size in [0usize, 176, 512, 1 << 17] {
        let cache: Arc<dyn PageCache> = Arc::new(MisreportedCache {
            inner: Pager::open_path(dir.path().join("small.gbpt"), &options(1024).pager)?,
            page_size,
        });
        let result = GbpTree::open(cache, U64Layout::fixed(), TreeOptions::default());
        assert!(
            matches!(result, Err(TreeError::Invalid(_))),
            "page size {page_size} was accepted"
        );
    }
    assert_eq!(fs::metadata(dir.path().join("small.gbpt"))?.len(), 0);
    Ok(())
}
