#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use gbptree::{
    FaultyFileIo, FileIo, GbpTree, PageCache, Pager, PagerOptions, Result, StdFileIo, TreeError,
    TreeOptions, U64Layout, Unlimited,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn options() -> TreeOptions {
    TreeOptions {
        pager: PagerOptions {
            page_size: 1024,
            cache_pages: 48,
            flush_batch_pages: 8,
        },
        ..TreeOptions::default()
    }
}

fn open_faulty(path: &Path) -> Result<(Arc<FaultyFileIo>, GbpTree<U64Layout>)> {
    let options = options();
    let file: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path)?);
    let faulty = Arc::new(FaultyFileIo::new(file));
    let io: Arc<dyn FileIo> = faulty.clone();
    let cache: Arc<dyn PageCache> = Arc::new(Pager::open(io, &options.pager)?);
    let tree = GbpTree::open(cache, U64Layout::fixed(), options)?;
    Ok((faulty, tree))
}

/// Loads the first checkpoint and stages a second batch of changes without
/// checkpointing it. Returns the contents of the first checkpoint.
fn stage(tree: &GbpTree<U64Layout>) -> Result<BTreeMap<u64, u64>> {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut keys: Vec<u64> = (0..1_500).collect();
    keys.shuffle(&mut rng);

    let mut writer = tree.writer()?;
    for key in &keys {
        writer.put(key, &(key * 2))?;
    }
    writer.close();
    tree.checkpoint(&Unlimited)?;
    let first: BTreeMap<u64, u64> = keys.iter().map(|key| (*key, key * 2)).collect();

    let mut writer = tree.writer()?;
    for key in keys.iter().take(600) {
        writer.remove(key)?;
    }
    for key in 1_500..2_300u64 {
        writer.put(&key, &key)?;
    }
    writer.close();
    Ok(first)
}

/// Writes reaching the file while the second checkpoint runs.
fn checkpoint_write_count() -> Result<u64> {
    let dir = tempdir().expect("tmpdir");
    let (faulty, tree) = open_faulty(&dir.path().join("dry.gbpt"))?;
    stage(&tree)?;
    let before = faulty.writes();
    tree.checkpoint(&Unlimited)?;
    Ok(faulty.writes() - before)
}

fn crash_during_checkpoint(after: u64, torn: bool) -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("crash.gbpt");
    let (faulty, tree) = open_faulty(&path)?;
    let first = stage(&tree)?;

    faulty.set_torn_writes(torn);
    faulty.fail_writes_after(after);
    let err = tree
        .checkpoint(&Unlimited)
        .expect_err("armed checkpoint must fail");
    assert!(matches!(err, TreeError::Io(_)), "unexpected error {err:?}");
    assert!(faulty.tripped());
    assert!(matches!(tree.writer().map(|_| ()), Err(TreeError::Usage(_))));
    drop(tree);
    drop(faulty);

    let tree = GbpTree::open_path(&path, U64Layout::fixed(), options())?;
    let recovered: BTreeMap<u64, u64> = tree.seek(&0, &u64::MAX)?.collect::<Result<_>>()?;
    assert_eq!(recovered, first, "crash after {after} writes (torn: {torn})");
    tree.consistency_check()?;

    let mut writer = tree.writer()?;
    writer.put(&9_999, &1)?;
    writer.close();
    tree.checkpoint(&Unlimited)?;
    tree.consistency_check()?;
    Ok(())
}

#[test]
fn crash_at_any_write_of_a_checkpoint_recovers_previous_one() -> Result<()> {
    let total = checkpoint_write_count()?;
    assert!(total > 4, "second checkpoint wrote only {total} pages");
    let points = [0, 1, total / 3, total / 2, total - 2, total - 1];
    for after in points {
        crash_during_checkpoint(after, false)?;
    }
    Ok(())
}

#[test]
fn torn_write_during_checkpoint_recovers_previous_one() -> Result<()> {
    let total = checkpoint_write_count()?;
    for after in [0, total / 2, total - 1] {
        crash_during_checkpoint(after, true)?;
    }
    Ok(())
}
