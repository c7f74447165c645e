//! Per-tablet storage engine seam.
//!
//! The control plane treats the LSM engine as opaque; this module is the
//! concrete implementation behind that seam, backed by one fjall keyspace per
//! tablet directory with one partition per locality group.
//!
//! Cell layout inside a partition (the "cell key"):
//!
//! ```text
//! row \x00 family \x00 qualifier \x00 inverted_ts(8, BE) kind(1)
//! ```
//!
//! Inverting the timestamp sorts newer cells first within a column; the kind
//! byte sorts delete markers before values at equal timestamps. A row-level
//! delete (empty family/qualifier) masks every cell of the row at or below
//! its timestamp.
//!
//! Split children do not copy data: they open ancestor keyspaces read-only
//! (via a shared per-process cache) and merge them under their own range
//! until `compact` migrates everything local and clears the lineage.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::meta::{KeyRange, TableSchema};

const KEY_SEPARATOR: u8 = 0x00;

/// Cell kind; the on-disk order (deletes first) is load-bearing for masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CellKind {
    Del = 0,
    DelColumn = 1,
    Value = 2,
}

impl CellKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(CellKind::Del),
            1 => Some(CellKind::DelColumn),
            2 => Some(CellKind::Value),
            _ => None,
        }
    }
}

/// One decoded cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub row: Vec<u8>,
    pub family: String,
    pub qualifier: Vec<u8>,
    pub timestamp: u64,
    pub kind: CellKind,
    pub value: Vec<u8>,
}

/// Encode a cell key. `\x00` is forbidden in rows/families/qualifiers of
/// structured tables; plain KV tables only ever use empty family/qualifier.
pub fn encode_cell_key(
    row: &[u8],
    family: &str,
    qualifier: &[u8],
    timestamp: u64,
    kind: CellKind,
) -> Vec<u8> {
    let mut key =
        Vec::with_capacity(row.len() + family.len() + qualifier.len() + 3 + 8 + 1);
    key.extend_from_slice(row);
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(family.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(qualifier);
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(&(!timestamp).to_be_bytes());
    key.push(kind as u8);
    key
}

/// Decode a cell key produced by `encode_cell_key`.
pub fn decode_cell_key(key: &[u8]) -> Option<(Vec<u8>, String, Vec<u8>, u64, CellKind)> {
    if key.len() < 12 {
        return None;
    }
    let (prefix, tail) = key.split_at(key.len() - 9);
    // prefix = row \0 family \0 qualifier \0
    if *prefix.last()? != KEY_SEPARATOR {
        return None;
    }
    let prefix = &prefix[..prefix.len() - 1];
    let row_end = prefix.iter().position(|&b| b == KEY_SEPARATOR)?;
    let rest = &prefix[row_end + 1..];
    let family_end = rest.iter().position(|&b| b == KEY_SEPARATOR)?;
    let row = prefix[..row_end].to_vec();
    let family = String::from_utf8(rest[..family_end].to_vec()).ok()?;
    let qualifier = rest[family_end + 1..].to_vec();
    let inv_ts = u64::from_be_bytes(tail[..8].try_into().ok()?);
    let kind = CellKind::from_byte(tail[8])?;
    Some((row, family, qualifier, !inv_ts, kind))
}

/// Scan filters and limits for `low_level_scan`.
#[derive(Debug, Default, Clone)]
pub struct ScanOptions {
    /// Families (and optional qualifier sets) to keep; empty = keep all.
    pub column_filter: HashMap<String, HashSet<Vec<u8>>>,
    /// Per-column version cap; zero means unlimited.
    pub max_versions: u32,
    /// Stop after this many cells; zero means unlimited.
    pub max_cells: usize,
}

impl ScanOptions {
    fn keeps_column(&self, family: &str, qualifier: &[u8]) -> bool {
        if self.column_filter.is_empty() {
            return true;
        }
        match self.column_filter.get(family) {
            None => false,
            Some(quals) => quals.is_empty() || quals.contains(qualifier),
        }
    }
}

/// Result of a `low_level_scan`.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub cells: Vec<Cell>,
    pub complete: bool,
    pub read_rows: u64,
    pub read_bytes: u64,
}

/// Process-wide keyspace cache so two tablets (e.g. both children of a
/// split) share one handle to a common ancestor directory.
#[derive(Clone, Default)]
pub struct KeyspaceCache {
    inner: Arc<Mutex<HashMap<PathBuf, Keyspace>>>,
}

impl KeyspaceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, path: &Path) -> anyhow::Result<Keyspace> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(keyspace) = guard.get(path) {
            return Ok(keyspace.clone());
        }
        let keyspace = fjall::Config::new(path)
            .open()
            .with_context(|| format!("open keyspace at {}", path.display()))?;
        guard.insert(path.to_path_buf(), keyspace.clone());
        Ok(keyspace)
    }

    /// Drop the cache's handle; outstanding clones keep working.
    pub fn evict(&self, path: &Path) {
        self.inner.lock().unwrap().remove(path);
    }

    /// Drop every cached handle, releasing the underlying file locks once
    /// outstanding clones are gone.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

struct Source {
    /// Ancestor tablet number; `None` for the tablet's own keyspace.
    tablet_num: Option<u64>,
    dir: PathBuf,
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
}

/// A loaded tablet: its own keyspace plus read-only ancestor sources.
///
/// Ancestors are dropped by `compact`, which is what lets GC reclaim their
/// directories; readers snapshot the current ancestor set per operation.
pub struct TabletIo {
    range: KeyRange,
    schema: TableSchema,
    path: String,
    cache: KeyspaceCache,
    own: Arc<Source>,
    ancestors: Mutex<Vec<Arc<Source>>>,
    lineage: Mutex<Vec<u64>>,
    /// Write timestamps are monotonic even within one microsecond.
    last_ts: AtomicU64,
    /// Read fence for rollback points: cells newer than this are invisible.
    read_fence: AtomicU64,
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

fn open_partitions(keyspace: &Keyspace, schema: &TableSchema) -> anyhow::Result<Vec<PartitionHandle>> {
    let mut partitions = Vec::with_capacity(schema.locality_groups.len());
    for lg in &schema.locality_groups {
        partitions.push(
            keyspace
                .open_partition(&lg.name, PartitionCreateOptions::default())
                .with_context(|| format!("open locality group {}", lg.name))?,
        );
    }
    Ok(partitions)
}

impl TabletIo {
    /// Load a tablet at `path` (relative to `root`) serving `range`.
    ///
    /// `lineage` names ancestor tablet numbers whose directories are opened
    /// read-only and merged beneath this tablet's own writes.
    pub fn load(
        cache: &KeyspaceCache,
        root: &Path,
        table: &str,
        path: &str,
        range: KeyRange,
        schema: TableSchema,
        lineage: Vec<u64>,
        rollback_fence: Option<u64>,
    ) -> anyhow::Result<Self> {
        let dir = root.join(path);
        std::fs::create_dir_all(&dir).context("create tablet dir")?;
        let keyspace = cache.open(&dir)?;
        let partitions = open_partitions(&keyspace, &schema)?;
        let own = Arc::new(Source {
            tablet_num: None,
            dir,
            keyspace,
            partitions,
        });

        let mut ancestors = Vec::with_capacity(lineage.len());
        for &num in &lineage {
            let ancestor_dir = root.join(crate::meta::tablet_path(table, num));
            if !ancestor_dir.exists() {
                anyhow::bail!(
                    "lineage tablet {num} missing on disk: {}",
                    ancestor_dir.display()
                );
            }
            let keyspace = cache.open(&ancestor_dir)?;
            let partitions = open_partitions(&keyspace, &schema)?;
            ancestors.push(Arc::new(Source {
                tablet_num: Some(num),
                dir: ancestor_dir,
                keyspace,
                partitions,
            }));
        }

        Ok(Self {
            range,
            schema,
            path: path.to_string(),
            cache: cache.clone(),
            own,
            ancestors: Mutex::new(ancestors),
            lineage: Mutex::new(lineage),
            last_ts: AtomicU64::new(0),
            read_fence: AtomicU64::new(rollback_fence.unwrap_or(u64::MAX)),
        })
    }

    /// Snapshot of every readable source: ancestors first, own last, so own
    /// cells win ties during merges.
    fn sources(&self) -> Vec<Arc<Source>> {
        let mut sources = self.ancestors.lock().unwrap().clone();
        sources.push(self.own.clone());
        sources
    }

    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn lineage(&self) -> Vec<u64> {
        self.lineage.lock().unwrap().clone()
    }

    /// Flush and detach. The keyspace cache entry stays for other sharers.
    pub fn unload(&self) -> anyhow::Result<()> {
        self.own
            .keyspace
            .persist(fjall::PersistMode::SyncAll)
            .context("persist tablet keyspace")?;
        Ok(())
    }

    fn next_ts(&self) -> u64 {
        let now = now_micros();
        self.last_ts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
                Some(last.max(now).max(last.wrapping_add(1)))
            })
            .map(|last| last.max(now).max(last.wrapping_add(1)))
            .unwrap_or(now)
    }

    fn partition_for_family(&self, family: &str) -> &PartitionHandle {
        &self.own.partitions[self.schema.lg_index_for_family(family)]
    }

    /// Plain-KV write: row value cell with an engine-assigned timestamp.
    pub fn write_one(&self, row: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.write_cell(row, "", b"", None, CellKind::Value, value)
    }

    /// Full-control cell write; `timestamp = None` assigns the next engine ts.
    pub fn write_cell(
        &self,
        row: &[u8],
        family: &str,
        qualifier: &[u8],
        timestamp: Option<u64>,
        kind: CellKind,
        value: &[u8],
    ) -> anyhow::Result<()> {
        let ts = timestamp.unwrap_or_else(|| self.next_ts());
        let key = encode_cell_key(row, family, qualifier, ts, kind);
        self.partition_for_family(family)
            .insert(key, value)
            .context("cell insert")?;
        Ok(())
    }

    /// Apply a batch of plain-KV puts in one storage batch.
    pub fn write_batch(&self, rows: &[(Vec<u8>, Vec<u8>)]) -> anyhow::Result<()> {
        let mut batch = self.own.keyspace.batch();
        let partition = self.partition_for_family("");
        for (row, value) in rows {
            let key = encode_cell_key(row, "", b"", self.next_ts(), CellKind::Value);
            batch.insert(partition, key, value.clone());
        }
        batch.commit().context("commit write batch")?;
        Ok(())
    }

    /// Plain-KV read of the newest visible value for `row`.
    ///
    /// Rows outside the tablet's range read as absent, even when the shared
    /// directory still holds their cells.
    pub fn read(&self, row: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        if !self.range.contains(row) {
            return Ok(None);
        }
        let fence = self.read_fence.load(Ordering::Relaxed);
        let mut row_del_ts = 0u64;
        for cell in self.row_cells(row, 0)? {
            if cell.timestamp > fence {
                continue;
            }
            match cell.kind {
                CellKind::Del => row_del_ts = row_del_ts.max(cell.timestamp),
                CellKind::DelColumn => {}
                CellKind::Value => {
                    if cell.family.is_empty() && cell.qualifier.is_empty() {
                        if cell.timestamp <= row_del_ts {
                            return Ok(None);
                        }
                        return Ok(Some(cell.value));
                    }
                }
            }
        }
        Ok(None)
    }

    /// All cells of one row, merged across sources, cell-key order.
    fn row_cells(&self, row: &[u8], lg: usize) -> anyhow::Result<Vec<Cell>> {
        let mut prefix = row.to_vec();
        prefix.push(KEY_SEPARATOR);
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for source in self.sources() {
            for item in source.partitions[lg].prefix(prefix.clone()) {
                let (key, value) = item.context("row scan")?;
                merged.insert(key.to_vec(), value.to_vec());
            }
        }
        let mut cells = Vec::with_capacity(merged.len());
        for (key, value) in merged {
            if let Some((row, family, qualifier, timestamp, kind)) = decode_cell_key(&key) {
                cells.push(Cell {
                    row,
                    family,
                    qualifier,
                    timestamp,
                    kind,
                    value,
                });
            }
        }
        Ok(cells)
    }

    /// Structured scan over [start_row, end_row) with delete-marker masking,
    /// column filtering, and per-column version caps.
    pub fn low_level_scan(
        &self,
        start_row: &[u8],
        end_row: &[u8],
        options: &ScanOptions,
    ) -> anyhow::Result<ScanResult> {
        let fence = self.read_fence.load(Ordering::Relaxed);
        let scan_start = clamp_start(&self.range, start_row);
        let scan_end = clamp_end(&self.range, end_row);

        let mut result = ScanResult {
            complete: true,
            ..Default::default()
        };
        for lg in 0..self.schema.locality_groups.len().max(1) {
            let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
            for source in self.sources() {
                // The end bound is enforced on the decoded row rather than as
                // a byte bound: an exclusive end row may itself contain the
                // key separator, which a concatenated bound would misorder.
                for item in source.partitions[lg].range(scan_start.clone()..) {
                    let (key, value) = item.context("scan")?;
                    match (&scan_end, decode_cell_key(&key)) {
                        (Some(end), Some((row, ..))) if row.as_slice() >= end.as_slice() => break,
                        _ => {}
                    }
                    merged.insert(key.to_vec(), value.to_vec());
                }
            }
            self.collect_visible(merged, options, fence, &mut result)?;
            if !result.complete {
                break;
            }
        }
        result.cells.sort_by(|a, b| {
            (&a.row, &a.family, &a.qualifier, std::cmp::Reverse(a.timestamp)).cmp(&(
                &b.row,
                &b.family,
                &b.qualifier,
                std::cmp::Reverse(b.timestamp),
            ))
        });
        Ok(result)
    }

    /// Apply masking rules to one locality group's merged cell stream.
    fn collect_visible(
        &self,
        merged: BTreeMap<Vec<u8>, Vec<u8>>,
        options: &ScanOptions,
        fence: u64,
        result: &mut ScanResult,
    ) -> anyhow::Result<()> {
        let mut current_row: Option<Vec<u8>> = None;
        let mut row_del_ts = 0u64;
        let mut col_del: HashMap<(String, Vec<u8>), u64> = HashMap::new();
        let mut col_versions: HashMap<(String, Vec<u8>), u32> = HashMap::new();

        for (key, value) in merged {
            let Some((row, family, qualifier, timestamp, kind)) = decode_cell_key(&key) else {
                continue;
            };
            if timestamp > fence {
                continue;
            }
            if !self.range.contains(&row) {
                continue;
            }
            if current_row.as_deref() != Some(row.as_slice()) {
                current_row = Some(row.clone());
                row_del_ts = 0;
                col_del.clear();
                col_versions.clear();
                result.read_rows += 1;
            }
            result.read_bytes += (key.len() + value.len()) as u64;
            match kind {
                CellKind::Del => {
                    row_del_ts = row_del_ts.max(timestamp);
                }
                CellKind::DelColumn => {
                    let slot = col_del.entry((family, qualifier)).or_insert(0);
                    *slot = (*slot).max(timestamp);
                }
                CellKind::Value => {
                    if timestamp <= row_del_ts {
                        continue;
                    }
                    let col = (family.clone(), qualifier.clone());
                    if col_del.get(&col).is_some_and(|&ts| timestamp <= ts) {
                        continue;
                    }
                    if !options.keeps_column(&family, &qualifier) {
                        continue;
                    }
                    let versions = col_versions.entry(col).or_insert(0);
                    let cap = if options.max_versions > 0 {
                        options.max_versions
                    } else {
                        self.max_versions_for(&family)
                    };
                    if cap > 0 && *versions >= cap {
                        continue;
                    }
                    *versions += 1;
                    result.cells.push(Cell {
                        row,
                        family,
                        qualifier,
                        timestamp,
                        kind,
                        value,
                    });
                    if options.max_cells > 0 && result.cells.len() >= options.max_cells {
                        result.complete = false;
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    fn max_versions_for(&self, family: &str) -> u32 {
        self.schema
            .column_families
            .iter()
            .find(|cf| cf.name == family)
            .map(|cf| cf.max_versions)
            .unwrap_or(0)
    }

    /// Greatest stored row at or before `row`, within this tablet's range.
    fn round_down_row(&self, row: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        // Cell keys of every row <= `row` sort below row + 0x01 (rows do not
        // contain the key separator).
        let mut bound = row.to_vec();
        bound.push(0x01);
        let mut best: Option<Vec<u8>> = None;
        for lg in 0..self.schema.locality_groups.len().max(1) {
            for source in self.sources() {
                for item in source.partitions[lg].range(..bound.clone()).rev() {
                    let (key, _) = item.context("round down scan")?;
                    let Some((found, ..)) = decode_cell_key(&key) else {
                        continue;
                    };
                    if found.as_slice() <= row && self.range.contains(&found) {
                        if best.as_deref().map_or(true, |b| found.as_slice() > b) {
                            best = Some(found);
                        }
                        break;
                    }
                }
            }
        }
        Ok(best)
    }

    /// Row-oriented scan: newest visible plain-KV value per row in
    /// [start_row, end_row), up to `max_rows`. Returns the rows and whether
    /// the scan reached the end of the requested interval.
    ///
    /// With `round_down`, the scan widens to include the greatest row at or
    /// before `start_row`.
    pub fn scan_rows(
        &self,
        start_row: &[u8],
        end_row: &[u8],
        max_rows: usize,
        round_down: bool,
    ) -> anyhow::Result<(Vec<(Vec<u8>, Vec<u8>)>, bool)> {
        let fence = self.read_fence.load(Ordering::Relaxed);
        let effective_start = if round_down {
            self.round_down_row(start_row)?
                .unwrap_or_else(|| start_row.to_vec())
        } else {
            start_row.to_vec()
        };
        let scan_start = clamp_start(&self.range, &effective_start);
        let scan_end = clamp_end(&self.range, end_row);

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for lg in 0..self.schema.locality_groups.len().max(1) {
            for source in self.sources() {
                for item in source.partitions[lg].range(scan_start.clone()..) {
                    let (key, value) = item.context("row scan")?;
                    match (&scan_end, decode_cell_key(&key)) {
                        (Some(end), Some((row, ..))) if row.as_slice() >= end.as_slice() => break,
                        _ => {}
                    }
                    merged.insert(key.to_vec(), value.to_vec());
                }
            }
        }

        let mut rows: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut current_row: Option<Vec<u8>> = None;
        let mut row_del_ts = 0u64;
        let mut emitted = false;
        for (key, value) in merged {
            let Some((row, family, qualifier, timestamp, kind)) = decode_cell_key(&key) else {
                continue;
            };
            if timestamp > fence || !self.range.contains(&row) {
                continue;
            }
            if current_row.as_deref() != Some(row.as_slice()) {
                if max_rows > 0 && rows.len() >= max_rows {
                    return Ok((rows, false));
                }
                current_row = Some(row.clone());
                row_del_ts = 0;
                emitted = false;
            }
            match kind {
                CellKind::Del => row_del_ts = row_del_ts.max(timestamp),
                CellKind::DelColumn => {}
                CellKind::Value => {
                    if !emitted
                        && family.is_empty()
                        && qualifier.is_empty()
                        && timestamp > row_del_ts
                    {
                        emitted = true;
                        rows.push((row, value));
                    }
                }
            }
        }
        Ok((rows, true))
    }

    /// Compute a split key: the median stored row of this tablet's range,
    /// falling back to the lexicographic midpoint for empty ranges.
    pub fn split_key(&self) -> anyhow::Result<Vec<u8>> {
        let mut rows: Vec<Vec<u8>> = Vec::new();
        let mut last: Option<Vec<u8>> = None;
        for lg in 0..self.schema.locality_groups.len().max(1) {
            for source in self.sources() {
                for item in source.partitions[lg].iter() {
                    let (key, _) = item.context("split scan")?;
                    let Some((row, ..)) = decode_cell_key(&key) else {
                        continue;
                    };
                    if !self.range.contains(&row) {
                        continue;
                    }
                    if last.as_deref() == Some(row.as_slice()) {
                        continue;
                    }
                    last = Some(row.clone());
                    rows.push(row);
                }
            }
        }
        rows.sort();
        rows.dedup();

        let candidate = rows.get(rows.len() / 2).cloned();
        match candidate {
            Some(mid)
                if (self.range.start.is_empty() || mid > self.range.start)
                    && (self.range.end.is_empty() || mid < self.range.end) =>
            {
                Ok(mid)
            }
            _ => find_average_key(&self.range.start, &self.range.end)
                .context("tablet has no splittable key"),
        }
    }

    /// Major compaction: migrate inherited cells local, drop out-of-range and
    /// masked cells, and clear lineage.
    pub fn compact(&self) -> anyhow::Result<()> {
        for lg in 0..self.schema.locality_groups.len().max(1) {
            // Merge every source, newest view, then rewrite the partition.
            let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
            for source in self.sources() {
                for item in source.partitions[lg].iter() {
                    let (key, value) = item.context("compact scan")?;
                    merged.insert(key.to_vec(), value.to_vec());
                }
            }

            let keep = self.visible_after_compaction(&merged);

            let partition = &self.own.partitions[lg];
            let mut batch = self.own.keyspace.batch();
            for item in partition.iter() {
                let (key, _) = item.context("compact clear")?;
                if !keep.contains_key(key.as_ref() as &[u8]) {
                    batch.remove(partition, key.to_vec());
                }
            }
            for (key, value) in &keep {
                batch.insert(partition, key.clone(), value.clone());
            }
            batch.commit().context("commit compaction")?;
        }
        // Everything inherited is now local: detach the ancestors so their
        // directories become reclaimable, and release our cached handles.
        self.lineage.lock().unwrap().clear();
        let detached = std::mem::take(&mut *self.ancestors.lock().unwrap());
        for source in &detached {
            self.cache.evict(&source.dir);
        }
        self.own
            .keyspace
            .persist(fjall::PersistMode::SyncAll)
            .context("persist after compaction")?;
        Ok(())
    }

    /// Decide which cells survive a major compaction of this tablet.
    fn visible_after_compaction(
        &self,
        merged: &BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut keep = BTreeMap::new();
        let mut current_row: Option<Vec<u8>> = None;
        let mut row_del_ts = 0u64;
        let mut col_del: HashMap<(String, Vec<u8>), u64> = HashMap::new();
        let mut col_versions: HashMap<(String, Vec<u8>), u32> = HashMap::new();
        for (key, value) in merged {
            let Some((row, family, qualifier, timestamp, kind)) = decode_cell_key(key) else {
                continue;
            };
            if !self.range.contains(&row) {
                continue;
            }
            if current_row.as_deref() != Some(row.as_slice()) {
                current_row = Some(row.clone());
                row_del_ts = 0;
                col_del.clear();
                col_versions.clear();
            }
            match kind {
                CellKind::Del => row_del_ts = row_del_ts.max(timestamp),
                CellKind::DelColumn => {
                    let slot = col_del.entry((family, qualifier)).or_insert(0);
                    *slot = (*slot).max(timestamp);
                }
                CellKind::Value => {
                    if timestamp <= row_del_ts {
                        continue;
                    }
                    let col = (family.clone(), qualifier.clone());
                    if col_del.get(&col).is_some_and(|&ts| timestamp <= ts) {
                        continue;
                    }
                    let cap = self.max_versions_for(&family);
                    let versions = col_versions.entry(col).or_insert(0);
                    if cap > 0 && *versions >= cap {
                        continue;
                    }
                    *versions += 1;
                    keep.insert(key.clone(), value.clone());
                }
            }
        }
        keep
    }

    /// Approximate on-disk size, total and per locality group.
    pub fn data_size(&self) -> (u64, Vec<u64>) {
        let mut lg_sizes = Vec::with_capacity(self.own.partitions.len());
        for partition in &self.own.partitions {
            let disk = partition.disk_space();
            let size = if disk > 0 {
                disk
            } else {
                // Unflushed tablets report a coarse memtable estimate.
                partition.approximate_len() as u64 * 64
            };
            lg_sizes.push(size);
        }
        (lg_sizes.iter().sum(), lg_sizes)
    }

    /// Files this tablet still inherits, per ancestor tablet number:
    /// every file currently under the ancestor's directory.
    pub fn inherited_live_files(&self) -> Vec<(u64, Vec<String>)> {
        let mut out = Vec::new();
        for source in self.ancestors.lock().unwrap().iter() {
            let Some(num) = source.tablet_num else {
                continue;
            };
            out.push((num, list_files_under(&source.dir)));
        }
        out
    }

    /// Raise/lower the rollback read fence (sequence-number visibility cap).
    pub fn set_read_fence(&self, fence: u64) {
        self.read_fence.store(fence, Ordering::Relaxed);
    }

    /// Current engine timestamp; recorded as a snapshot id by the master.
    pub fn snapshot_point(&self) -> u64 {
        self.next_ts()
    }
}

fn clamp_start(range: &KeyRange, start_row: &[u8]) -> Vec<u8> {
    let effective = if start_row < range.start.as_slice() {
        range.start.as_slice()
    } else {
        start_row
    };
    effective.to_vec()
}

fn clamp_end(range: &KeyRange, end_row: &[u8]) -> Option<Vec<u8>> {
    match (end_row.is_empty(), range.end.is_empty()) {
        (true, true) => None,
        (true, false) => Some(range.end.clone()),
        (false, true) => Some(end_row.to_vec()),
        (false, false) => Some(std::cmp::min(end_row, range.end.as_slice()).to_vec()),
    }
}

/// List every file under `dir`, as paths relative to `dir`.
pub fn list_files_under(dir: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(dir) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    out.sort();
    out
}

/// Lexicographically "middle" key between `start` and `end`, treating each
/// key as a base-256 fraction (start padded with 0x00; an empty end reads as
/// +inf, i.e. 0xFF...). Returns `None` exactly when no byte string lies
/// strictly between the bounds (end == start, or end == start + 0x00...).
pub fn find_average_key(start: &[u8], end: &[u8]) -> Option<Vec<u8>> {
    if !end.is_empty() && start >= end {
        return None;
    }
    if start.is_empty() && end.is_empty() {
        return Some(vec![0x7F]);
    }

    let len = start.len().max(end.len());
    let mut low = start.to_vec();
    low.resize(len, 0x00);
    let mut high = if end.is_empty() {
        vec![0xFF; len]
    } else {
        let mut high = end.to_vec();
        high.resize(len, 0x00);
        high
    };

    // avg = floor((low + high) / 2), big-endian, tracking the halving remainder.
    let mut carry = 0u16;
    for i in 0..len {
        let sum = low[i] as u16 + high[i] as u16 + (carry << 8);
        high[i] = (sum / 2) as u8;
        carry = sum % 2;
    }
    let mut avg = high;
    if avg.as_slice() <= start {
        // Midpoint collapsed onto the lower bound: descend half a step.
        avg.push(0x80);
    } else if carry == 0 {
        // Exact division: pin the fractional digit so the result stays
        // comparable no matter how callers extend it.
        avg.push(0x00);
    }

    let above = avg.as_slice() > start;
    let below = end.is_empty() || avg.as_slice() < end;
    (above && below).then_some(avg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_key_required_cases() {
        assert_eq!(find_average_key(b"", b""), Some(vec![0x7F]));
        assert_eq!(find_average_key(b"", b"b"), Some(b"1\x00".to_vec()));
        assert_eq!(find_average_key(b"", b"\x01"), Some(vec![0x00]));
        assert_eq!(find_average_key(b"helloa", b"hellob"), Some(b"helloa\x80".to_vec()));
        assert_eq!(find_average_key(b"a", b"b"), Some(b"a\x80".to_vec()));
        assert_eq!(
            find_average_key(b"a\xff\xff", b"b"),
            Some(b"a\xff\xff\x80".to_vec())
        );
    }

    #[test]
    fn average_key_failure_cases() {
        assert_eq!(find_average_key(b"", b"\x00"), None);
        assert_eq!(find_average_key(b"aaa", b"aaa"), None);
        assert_eq!(find_average_key(b"aaa", b"aaa\x00"), None);
        assert_eq!(find_average_key(b"", b"\x00\x00"), None);
        assert_eq!(find_average_key(b"b", b"a"), None);
    }

    #[test]
    fn average_key_orders_strictly() {
        let cases: Vec<(&[u8], &[u8])> = vec![
            (b"abc", b"abe"),
            (b"a", b"ab"),
            (b"a\x10", b"b"),
            (b"b", b""),
            (b"000000000000001480186993", b"000000000000002147352684"),
            (b"000017\xF0", b"000018000000001397050688"),
            (b"0000\x7F", b"0000\x80"),
            (b"a\x00", b"a\x01"),
        ];
        for (start, end) in cases {
            let mid = find_average_key(start, end)
                .unwrap_or_else(|| panic!("no key between {start:?} and {end:?}"));
            assert!(mid.as_slice() > start, "{mid:?} <= {start:?}");
            if !end.is_empty() {
                assert!(mid.as_slice() < end, "{mid:?} >= {end:?}");
            }
        }
    }

    #[test]
    fn cell_key_round_trip() {
        let key = encode_cell_key(b"row1", "cf", b"qual", 12345, CellKind::Value);
        let (row, family, qualifier, ts, kind) = decode_cell_key(&key).unwrap();
        assert_eq!(row, b"row1");
        assert_eq!(family, "cf");
        assert_eq!(qualifier, b"qual");
        assert_eq!(ts, 12345);
        assert_eq!(kind, CellKind::Value);
    }

    #[test]
    fn newer_cells_sort_first_within_column() {
        let older = encode_cell_key(b"r", "cf", b"q", 100, CellKind::Value);
        let newer = encode_cell_key(b"r", "cf", b"q", 200, CellKind::Value);
        assert!(newer < older);
        // Delete sorts before value at the same timestamp.
        let del = encode_cell_key(b"r", "cf", b"q", 200, CellKind::DelColumn);
        assert!(del < newer);
    }
}
