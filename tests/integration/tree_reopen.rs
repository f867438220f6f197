#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::Path;

use gbptree::{BytesLayout, GbpTree, PagerOptions, Result, TreeOptions, U64Layout, Unlimited};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn options() -> TreeOptions {
    TreeOptions {
        pager: PagerOptions {
            page_size: 2048,
            cache_pages: 64,
            flush_batch_pages: 16,
        },
        ..TreeOptions::default()
    }
}

fn open(path: &Path) -> Result<GbpTree<U64Layout>> {
    GbpTree::open_path(path, U64Layout::fixed(), options())
}

fn contents(tree: &GbpTree<U64Layout>) -> Result<BTreeMap<u64, u64>> {
    tree.seek(&0, &u64::MAX)?.collect()
}

#[test]
fn checkpointed_contents_survive_close_and_reopen() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("reopen.gbpt");
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let mut model = BTreeMap::new();

    let tree = open(&path)?;
    let mut writer = tree.writer()?;
    for _ in 0..4_000 {
        let key = rng.gen_range(0..20_000u64);
        let value = rng.gen::<u64>();
        writer.put(&key, &value)?;
        model.insert(key, value);
    }
    writer.close();
    tree.checkpoint(&Unlimited)?;
    let stable = tree.stable_generation();
    tree.close()?;

    let tree = open(&path)?;
    assert_eq!(tree.stable_generation(), stable);
    assert_eq!(contents(&tree)?, model);
    tree.consistency_check()?;

    let mut writer = tree.writer()?;
    for key in model.keys().copied().take(1_000).collect::<Vec<_>>() {
        writer.remove(&key)?;
        model.remove(&key);
    }
    writer.close();
    tree.checkpoint(&Unlimited)?;
    tree.close()?;

    let tree = open(&path)?;
    assert_eq!(contents(&tree)?, model);
    tree.consistency_check()?;
    Ok(())
}

#[test]
fn mutations_after_last_checkpoint_are_discarded() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("discard.gbpt");

    let tree = open(&path)?;
    let mut writer = tree.writer()?;
    for key in 0..500u64 {
        writer.put(&key, &key)?;
    }
    writer.close();
    tree.checkpoint(&Unlimited)?;

    let mut writer = tree.writer()?;
    for key in 500..1_500u64 {
        writer.put(&key, &key)?;
    }
    for key in 0..100u64 {
        writer.remove(&key)?;
    }
    writer.close();
    tree.close()?;

    let tree = open(&path)?;
    let expected: BTreeMap<u64, u64> = (0..500u64).map(|key| (key, key)).collect();
    assert_eq!(contents(&tree)?, expected);
    tree.consistency_check()?;
    Ok(())
}

#[test]
fn dropped_handle_recovers_last_checkpoint() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("dropped.gbpt");

    let tree = open(&path)?;
    let mut writer = tree.writer()?;
    for key in 0..800u64 {
        writer.put(&key, &(key + 1))?;
    }
    writer.close();
    tree.checkpoint(&Unlimited)?;
    let mut writer = tree.writer()?;
    for key in 0..800u64 {
        writer.put(&key, &0)?;
    }
    writer.close();
    drop(tree);

    let tree = open(&path)?;
    for key in [0u64, 399, 799] {
        assert_eq!(tree.get(&key)?, Some(key + 1));
    }
    assert_eq!(tree.get(&800)?, None);
    tree.consistency_check()?;
    Ok(())
}

#[test]
fn clean_close_round_trips_generations() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("clean.gbpt");

    let tree = GbpTree::open_path(&path, BytesLayout, options())?;
    let mut writer = tree.writer()?;
    writer.put(&b"alpha".to_vec(), &b"1".to_vec())?;
    writer.put(&b"beta".to_vec(), &b"22".to_vec())?;
    writer.close();
    tree.checkpoint(&Unlimited)?;
    let stable = tree.stable_generation();
    let unstable = tree.unstable_generation();
    tree.close()?;

    for round in 1..=3u64 {
        let tree = GbpTree::open_path(&path, BytesLayout, options())?;
        assert_eq!(tree.stable_generation(), stable);
        assert_eq!(tree.unstable_generation(), unstable + 2 * round);
        assert_eq!(tree.get(&b"beta".to_vec())?, Some(b"22".to_vec()));
        tree.close()?;
    }
    Ok(())
}
