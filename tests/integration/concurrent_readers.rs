#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use gbptree::{
    BytesLayout, GbpTree, PagerOptions, Result, TreeError, TreeOptions, U64Layout, Unlimited,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

const KEY_SPACE: u64 = 4_000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn options() -> TreeOptions {
    TreeOptions {
        pager: PagerOptions {
            page_size: 1024,
            cache_pages: 128,
            flush_batch_pages: 16,
        },
        ..TreeOptions::default()
    }
}

/// Scans `[from, to)` and checks the cursor's ordering guarantees.
fn checked_scan(tree: &GbpTree<U64Layout>, from: u64, to: u64) -> Result<usize> {
    let mut previous: Option<u64> = None;
    let mut seen = 0;
    for entry in tree.seek(&from, &to)? {
        let (key, value) = entry?;
        assert!(key >= from && key < to, "key {key} outside [{from}, {to})");
        if let Some(prev) = previous {
            assert!(key > prev, "key {key} returned after {prev}");
        }
        assert!(value == key || value == key + 1, "value {value} for key {key}");
        previous = Some(key);
        seen += 1;
    }
    Ok(seen)
}

#[test]
fn readers_see_ordered_keys_while_writer_mutates() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let tree = GbpTree::open_path(dir.path().join("readers.gbpt"), U64Layout::fixed(), options())?;
    let mut writer = tree.writer()?;
    for key in (0..KEY_SPACE).step_by(2) {
        writer.put(&key, &key)?;
    }
    writer.close();
    tree.checkpoint(&Unlimited)?;

    let done = AtomicBool::new(false);
    thread::scope(|scope| -> Result<()> {
        let readers: Vec<_> = (0..4u64)
            .map(|id| {
                let tree = &tree;
                let done = &done;
                scope.spawn(move || -> Result<usize> {
                    let mut rng = ChaCha8Rng::seed_from_u64(id);
                    let mut scans = 0;
                    while !done.load(Ordering::Acquire) || scans < 8 {
                        let from = rng.gen_range(0..KEY_SPACE);
                        let to = rng.gen_range(from..=KEY_SPACE);
                        checked_scan(tree, from, to)?;
                        let key = rng.gen_range(0..KEY_SPACE);
                        if let Some(value) = tree.get(&key)? {
                            assert!(value == key || value == key + 1);
                        }
                        scans += 1;
                    }
                    Ok(scans)
                })
            })
            .collect();

        let mut rng = ChaCha8Rng::seed_from_u64(99);
        for round in 0..6 {
            let mut writer = tree.writer()?;
            for _ in 0..1_500 {
                let key = rng.gen_range(0..KEY_SPACE);
                if rng.gen_bool(0.3) {
                    writer.remove(&key)?;
                } else {
                    writer.put(&key, &(key + round % 2))?;
                }
            }
            writer.close();
            tree.checkpoint(&Unlimited)?;
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            let scans = reader.join().expect("reader thread panicked")?;
            assert!(scans >= 8);
        }
        Ok(())
    })?;

    tree.consistency_check()?;
    Ok(())
}

#[test]
fn second_writer_from_another_thread_is_rejected() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let tree = GbpTree::open_path(dir.path().join("writers.gbpt"), U64Layout::fixed(), options())?;
    let writer = tree.writer()?;
    thread::scope(|scope| {
        let rejected = scope
            .spawn(|| matches!(tree.writer().map(|_| ()), Err(TreeError::ConcurrentWriter)))
            .join()
            .expect("thread panicked");
        assert!(rejected);
    });
    writer.close();
    assert!(tree.writer().is_ok());
    Ok(())
}

const ANCHORS: usize = 3_000;
const ANCHOR_STEP: usize = 10;

fn anchor(idx: usize) -> Vec<u8> {
    format!("k{:07}", idx * ANCHOR_STEP).into_bytes()
}

fn filler(idx: usize, seq: usize) -> Vec<u8> {
    format!("k{:07}-{seq:03}", idx * ANCHOR_STEP).into_bytes()
}

/// Scans the anchors in `[first, last)` and fails if any of them is missing.
fn scan_anchors(tree: &GbpTree<BytesLayout>, first: usize, last: usize) -> Result<()> {
    let mut previous: Option<Vec<u8>> = None;
    let mut expected = first;
    for entry in tree.seek(&anchor(first), &anchor(last))? {
        let (key, _) = entry?;
        if let Some(prev) = &previous {
            assert!(key > *prev, "keys out of order during scan");
        }
        if !key.contains(&b'-') {
            assert_eq!(key, anchor(expected), "scan skipped anchor {expected}");
            expected += 1;
        }
        previous = Some(key);
    }
    assert_eq!(expected, last, "scan stopped before anchor {expected}");
    Ok(())
}

#[test]
fn untouched_keys_stay_visible_while_neighbours_split_and_merge() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let tree = GbpTree::open_path(dir.path().join("anchors.gbpt"), BytesLayout, options())?;
    let mut writer = tree.writer()?;
    for idx in 0..ANCHORS {
        writer.put(&anchor(idx), &b"a".to_vec())?;
    }
    writer.close();
    tree.checkpoint(&Unlimited)?;

    let done = AtomicBool::new(false);
    thread::scope(|scope| -> Result<()> {
        let readers: Vec<_> = (0..3u64)
            .map(|id| {
                let tree = &tree;
                let done = &done;
                scope.spawn(move || -> Result<()> {
                    let mut rng = ChaCha8Rng::seed_from_u64(100 + id);
                    let mut rounds = 0;
                    while !done.load(Ordering::Acquire) || rounds < 8 {
                        for _ in 0..64 {
                            let idx = rng.gen_range(0..ANCHORS);
                            assert!(
                                tree.get(&anchor(idx))?.is_some(),
                                "anchor {idx} was not found"
                            );
                        }
                        let first = rng.gen_range(0..ANCHORS - 50);
                        scan_anchors(tree, first, first + 50)?;
                        rounds += 1;
                    }
                    Ok(())
                })
            })
            .collect();

        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let fat = vec![0xF0; 120];
        for round in 0..12 {
            let base = rng.gen_range(0..ANCHORS - 200);
            let mut writer = tree.writer()?;
            for idx in base..base + 200 {
                for seq in 0..3 {
                    writer.put(&filler(idx, seq), &fat)?;
                }
            }
            for idx in base..base + 200 {
                for seq in 0..3 {
                    writer.remove(&filler(idx, seq))?;
                }
            }
            writer.close();
            if round % 4 == 3 {
                tree.checkpoint(&Unlimited)?;
            }
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            reader.join().expect("reader thread panicked")?;
        }
        Ok(())
    })?;

    let report = tree.consistency_check()?;
    assert_eq!(report.keys, ANCHORS);
    Ok(())
}
