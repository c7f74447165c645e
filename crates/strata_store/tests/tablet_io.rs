//! Storage-seam scenarios: load/write/read/unload, overwrites, scoped
//! compaction, and low-level scans with delete markers.

use strata_store::meta::{ColumnFamilySchema, KeyRange, TableSchema};
use strata_store::tablet_io::{CellKind, KeyspaceCache, ScanOptions, TabletIo};

fn key(i: u64) -> Vec<u8> {
    format!("{i:011}").into_bytes()
}

fn load_tablet(
    cache: &KeyspaceCache,
    root: &std::path::Path,
    num: u64,
    start: &[u8],
    end: &[u8],
    schema: TableSchema,
    lineage: Vec<u64>,
) -> TabletIo {
    TabletIo::load(
        cache,
        root,
        "t",
        &strata_store::meta::tablet_path("t", num),
        KeyRange::new(start, end),
        schema,
        lineage,
        None,
    )
    .expect("load tablet")
}

fn column_schema() -> TableSchema {
    let mut schema = TableSchema::kv("t");
    schema.column_families = vec![ColumnFamilySchema {
        name: "column".into(),
        locality_group: "lg0".into(),
        max_versions: 3,
        ttl_secs: 0,
    }];
    schema
}

#[test]
fn general_write_read_unload() {
    let dir = tempfile::tempdir().unwrap();
    let cache = KeyspaceCache::new();
    let tablet = load_tablet(&cache, dir.path(), 1, b"", b"", TableSchema::kv("t"), vec![]);

    tablet.write_one(b"555", b"value of 555").unwrap();
    assert_eq!(
        tablet.read(b"555").unwrap(),
        Some(b"value of 555".to_vec())
    );
    assert_eq!(tablet.read(b"666").unwrap(), None);
    tablet.unload().unwrap();
}

#[test]
fn overwrite_returns_latest_value() {
    let dir = tempfile::tempdir().unwrap();
    let cache = KeyspaceCache::new();
    let tablet = load_tablet(&cache, dir.path(), 1, b"", b"", TableSchema::kv("t"), vec![]);

    tablet.write_one(b"555", b"value of 555").unwrap();
    tablet.write_one(b"555", b"value of 666").unwrap();
    assert_eq!(
        tablet.read(b"555").unwrap(),
        Some(b"value of 666".to_vec())
    );
    tablet.unload().unwrap();
}

#[test]
fn compact_scoped_tablet_drops_out_of_range_rows() {
    let dir = tempfile::tempdir().unwrap();
    let cache = KeyspaceCache::new();
    let tablet = load_tablet(&cache, dir.path(), 1, b"", b"", TableSchema::kv("t"), vec![]);
    let rows: Vec<(Vec<u8>, Vec<u8>)> = (0..100).map(|i| (key(i), key(i))).collect();
    tablet.write_batch(&rows).unwrap();
    tablet.unload().unwrap();

    // Reopen the same directory scoped to [5, 50) and compact.
    let scoped = load_tablet(
        &cache,
        dir.path(),
        1,
        &key(5),
        &key(50),
        TableSchema::kv("t"),
        vec![],
    );
    scoped.compact().unwrap();

    for i in 0..100u64 {
        let value = scoped.read(&key(i)).unwrap();
        if (5..50).contains(&i) {
            assert_eq!(value, Some(key(i)), "key {i} should survive");
        } else {
            assert_eq!(value, None, "key {i} should be gone");
        }
    }
    scoped.unload().unwrap();
}

#[test]
fn low_level_scan_respects_delete_markers() {
    let dir = tempfile::tempdir().unwrap();
    let cache = KeyspaceCache::new();
    let tablet = load_tablet(&cache, dir.path(), 1, b"", b"", column_schema(), vec![]);
    let scan_all = |tablet: &TabletIo| {
        tablet
            .low_level_scan(b"", b"", &ScanOptions::default())
            .unwrap()
            .cells
            .len()
    };

    // Row deletes, then a value newer than the delete.
    tablet
        .write_cell(b"row", "", b"", None, CellKind::Del, b"")
        .unwrap();
    tablet
        .write_cell(b"row1", "", b"", None, CellKind::Del, b"")
        .unwrap();
    tablet
        .write_cell(b"row", "column", b"qualifer", None, CellKind::Value, b"lala")
        .unwrap();
    assert_eq!(scan_all(&tablet), 1);

    // A fresh row delete masks everything at or below its timestamp.
    tablet
        .write_cell(b"row", "", b"", None, CellKind::Del, b"")
        .unwrap();
    assert_eq!(scan_all(&tablet), 0);

    tablet
        .write_cell(b"row", "column", b"2a", None, CellKind::Value, b"lala")
        .unwrap();
    assert_eq!(scan_all(&tablet), 1);

    // Reset both rows, then build up versions.
    tablet
        .write_cell(b"row", "", b"", None, CellKind::Del, b"")
        .unwrap();
    tablet
        .write_cell(b"row1", "", b"", None, CellKind::Del, b"")
        .unwrap();
    for _ in 0..3 {
        tablet
            .write_cell(b"row", "column", b"1a", None, CellKind::Value, b"lala")
            .unwrap();
    }
    tablet
        .write_cell(b"row1", "column", b"1a", None, CellKind::Value, b"lala")
        .unwrap();
    tablet
        .write_cell(b"row1", "column", b"2b", None, CellKind::Value, b"lala")
        .unwrap();

    // Both rows: 3 versions of row/column:1a plus two row1 cells.
    let result = tablet
        .low_level_scan(b"row", b"row1\x00", &ScanOptions::default())
        .unwrap();
    assert_eq!(result.cells.len(), 5);

    // Column filter narrows to row's 1a versions.
    let mut options = ScanOptions::default();
    options
        .column_filter
        .entry("column".into())
        .or_default()
        .insert(b"1a".to_vec());
    let result = tablet
        .low_level_scan(b"row", b"row\x00", &options)
        .unwrap();
    assert_eq!(result.cells.len(), 3);

    // Version cap below the stored count.
    options.max_versions = 2;
    let result = tablet
        .low_level_scan(b"row", b"row\x00", &options)
        .unwrap();
    assert_eq!(result.cells.len(), 2);

    tablet.unload().unwrap();
}

#[test]
fn data_size_grows_with_writes() {
    let dir = tempfile::tempdir().unwrap();
    let cache = KeyspaceCache::new();
    let tablet = load_tablet(&cache, dir.path(), 1, b"", b"", TableSchema::kv("t"), vec![]);
    let rows: Vec<(Vec<u8>, Vec<u8>)> = (0..500).map(|i| (key(i), vec![b'x'; 128])).collect();
    tablet.write_batch(&rows).unwrap();
    tablet.unload().unwrap();
    let (total, lg_sizes) = tablet.data_size();
    assert!(total > 0);
    assert_eq!(lg_sizes.len(), 1);
}
