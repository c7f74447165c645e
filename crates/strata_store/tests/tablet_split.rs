//! Split scenarios: split-key computation over a populated tablet and
//! split-to-subtable replay through lineage.

use strata_store::meta::{tablet_path, KeyRange, TableSchema};
use strata_store::tablet_io::{KeyspaceCache, TabletIo};

const N: u64 = 50_000;

fn key(i: u64) -> Vec<u8> {
    format!("{i:011}").into_bytes()
}

fn load_tablet(
    cache: &KeyspaceCache,
    root: &std::path::Path,
    num: u64,
    start: &[u8],
    end: &[u8],
    lineage: Vec<u64>,
) -> TabletIo {
    TabletIo::load(
        cache,
        root,
        "t",
        &tablet_path("t", num),
        KeyRange::new(start, end),
        TableSchema::kv("t"),
        lineage,
        None,
    )
    .expect("load tablet")
}

fn fill(tablet: &TabletIo, from: u64, to: u64) {
    let mut batch = Vec::with_capacity(1024);
    for i in from..to {
        batch.push((key(i), key(i)));
        if batch.len() == 1024 {
            tablet.write_batch(&batch).unwrap();
            batch.clear();
        }
    }
    if !batch.is_empty() {
        tablet.write_batch(&batch).unwrap();
    }
}

#[test]
fn split_key_lands_strictly_inside_the_range() {
    let dir = tempfile::tempdir().unwrap();
    let cache = KeyspaceCache::new();
    let tablet = load_tablet(&cache, dir.path(), 1, b"", b"", vec![]);
    fill(&tablet, 0, N);

    let split_key = tablet.split_key().unwrap();
    assert!(!split_key.is_empty());
    assert!(split_key.as_slice() > b"".as_slice());
    // Roughly the median of a uniform keyset.
    let mid: u64 = String::from_utf8_lossy(&split_key).parse().unwrap();
    assert!(mid > N / 4 && mid < 3 * N / 4, "median off: {mid}");
    tablet.unload().unwrap();

    // A narrower scope still yields an in-bounds key.
    let scoped = load_tablet(&cache, dir.path(), 1, &key(5000), &key(8000), vec![]);
    let split_key = scoped.split_key().unwrap();
    assert!(split_key.as_slice() > key(5000).as_slice());
    assert!(split_key.as_slice() < key(8000).as_slice());
    scoped.unload().unwrap();
}

#[test]
fn empty_tablet_splits_at_the_lexicographic_midpoint() {
    let dir = tempfile::tempdir().unwrap();
    let cache = KeyspaceCache::new();
    let tablet = load_tablet(&cache, dir.path(), 1, b"a", b"b", vec![]);
    let split_key = tablet.split_key().unwrap();
    assert!(split_key.as_slice() > b"a".as_slice());
    assert!(split_key.as_slice() < b"b".as_slice());
}

#[test]
fn split_to_subtables_replays_every_key_through_lineage() {
    let dir = tempfile::tempdir().unwrap();
    let cache = KeyspaceCache::new();
    let parent = load_tablet(&cache, dir.path(), 1, b"", b"", vec![]);
    fill(&parent, 0, N / 2);
    fill(&parent, N / 2, N);
    parent.unload().unwrap();

    let split_key = parent.split_key().unwrap();
    let split_num: u64 = String::from_utf8_lossy(&split_key).parse().unwrap();
    parent.unload().unwrap();
    drop(parent);

    // Children live in fresh directories and read the parent via lineage.
    let left = load_tablet(&cache, dir.path(), 2, b"", &split_key, vec![1]);
    for i in 0..split_num {
        assert_eq!(left.read(&key(i)).unwrap(), Some(key(i)), "left key {i}");
    }
    // Keys past the split do not belong to the left child.
    assert_eq!(left.read(&key(split_num)).unwrap(), None);
    assert_eq!(left.inherited_live_files().len(), 1);
    left.unload().unwrap();

    let right = load_tablet(&cache, dir.path(), 3, &split_key, b"", vec![1]);
    for i in split_num..N {
        assert_eq!(right.read(&key(i)).unwrap(), Some(key(i)), "right key {i}");
    }
    assert_eq!(right.read(&key(split_num - 1)).unwrap(), None);
    right.unload().unwrap();
}

#[test]
fn compaction_migrates_inherited_data_and_clears_lineage() {
    let dir = tempfile::tempdir().unwrap();
    let cache = KeyspaceCache::new();
    let parent = load_tablet(&cache, dir.path(), 1, b"", b"", vec![]);
    fill(&parent, 0, 1000);
    parent.unload().unwrap();
    drop(parent);

    let child = load_tablet(&cache, dir.path(), 2, b"", &key(500), vec![1]);
    assert!(!child.inherited_live_files().is_empty());
    child.compact().unwrap();
    assert!(child.lineage().is_empty());
    assert!(child.inherited_live_files().is_empty());

    // Reads no longer depend on the parent directory.
    for i in 0..500 {
        assert_eq!(child.read(&key(i)).unwrap(), Some(key(i)));
    }
    child.unload().unwrap();
}
