#![allow(missing_docs)]

use gbptree::{CursorState, GbpTree, PagerOptions, Result, TreeOptions, U64Layout, Unlimited};
use tempfile::tempdir;

const BATCHES: u64 = 10;
const BATCH_SIZE: u64 = 1_000;

fn options() -> TreeOptions {
    TreeOptions {
        pager: PagerOptions {
            page_size: 4096,
            cache_pages: 256,
            flush_batch_pages: 32,
        },
        ..TreeOptions::default()
    }
}

fn load_and_scan(layout: U64Layout, name: &str) -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let tree = GbpTree::open_path(dir.path().join(name), layout, options())?;

    for batch in 0..BATCHES {
        let mut writer = tree.writer()?;
        for key in batch * BATCH_SIZE..(batch + 1) * BATCH_SIZE {
            writer.put(&key, &(key * 2))?;
        }
        writer.close();
        tree.checkpoint(&Unlimited)?;
    }
    assert_eq!(tree.stable_generation(), BATCHES);

    let total = BATCHES * BATCH_SIZE;
    let mut cursor = tree.seek(&0, &total)?;
    let mut expected = 0u64;
    while cursor.next()? {
        let hit = cursor.get().expect("positioned cursor has a hit");
        assert_eq!(*hit.key(), expected);
        assert_eq!(*hit.value(), expected * 2);
        expected += 1;
    }
    assert_eq!(expected, total);
    assert_eq!(cursor.state(), CursorState::Exhausted);
    assert!(!cursor.next()?);

    let report = tree.consistency_check()?;
    assert_eq!(report.keys as u64, total);
    assert!(report.height >= 2);
    assert_eq!(report.stable_generation, BATCHES);

    let stats = tree.stats_snapshot();
    assert_eq!(stats.checkpoints, BATCHES);
    assert!(stats.leaf_splits > 0);
    tree.close()
}

#[test]
fn fixed_layout_survives_batched_inserts() -> Result<()> {
    load_and_scan(U64Layout::fixed(), "fixed.gbpt")
}

#[test]
fn dynamic_layout_survives_batched_inserts() -> Result<()> {
    load_and_scan(U64Layout::dynamic(), "dynamic.gbpt")
}

#[test]
fn removing_every_other_key_keeps_scan_ordered() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let tree = GbpTree::open_path(dir.path().join("sparse.gbpt"), U64Layout::fixed(), options())?;
    let mut writer = tree.writer()?;
    for key in 0..5_000u64 {
        writer.put(&key, &(key * 2))?;
    }
    for key in (0..5_000u64).step_by(2) {
        assert_eq!(writer.remove(&key)?, Some(key * 2));
    }
    assert_eq!(writer.remove(&0)?, None);
    writer.close();
    tree.checkpoint(&Unlimited)?;

    let keys = tree
        .seek(&0, &5_000)?
        .map(|entry| entry.map(|(key, _)| key))
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(keys, (1..5_000u64).step_by(2).collect::<Vec<_>>());

    let report = tree.consistency_check()?;
    assert_eq!(report.keys, 2_500);
    Ok(())
}
