//! Master-side in-memory catalog of tables and tablets.
//!
//! `Tablet` and `Table` are shared handles over mutex-guarded state; status
//! changes go through compare-and-swap helpers that enforce the fixed
//! transition graphs, so a stale async callback can never regress a tablet
//! that has already moved on.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::fragment::RangeFragment;
use crate::meta::{
    parse_tablet_path, KeyRange, Rollback, TableMeta, TableSchema, TableStatus, TabletCounter,
    TabletMeta, TabletStatus,
};
use crate::meta_codec::{self, MetaRecord};
use crate::rpc::META_TABLE_NAME;
use crate::status::StatusCode;

/// Decaying weighted fold used for per-tablet load averages: three parts
/// history, one part new sample.
pub fn counter_weighted_sum(history: u64, sample: u64) -> u64 {
    (history * 3 + sample) / 4
}

#[derive(Debug)]
struct TabletInner {
    meta: TabletMeta,
    average: TabletCounter,
    expect_server_addr: String,
    update_time_ms: u64,
    load_time_ms: u64,
}

/// Shared handle to one tablet's master-side state.
#[derive(Debug, Clone)]
pub struct Tablet {
    inner: Arc<Mutex<TabletInner>>,
}

impl Tablet {
    pub fn new(meta: TabletMeta) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TabletInner {
                meta,
                average: TabletCounter::default(),
                expect_server_addr: String::new(),
                update_time_ms: crate::unix_time_ms(),
                load_time_ms: 0,
            })),
        }
    }

    pub fn meta(&self) -> TabletMeta {
        self.inner.lock().unwrap().meta.clone()
    }

    pub fn table_name(&self) -> String {
        self.inner.lock().unwrap().meta.table_name.clone()
    }

    pub fn key_range(&self) -> KeyRange {
        self.inner.lock().unwrap().meta.key_range.clone()
    }

    pub fn path(&self) -> String {
        self.inner.lock().unwrap().meta.path.clone()
    }

    pub fn tablet_num(&self) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .meta
            .tablet_num()
            .unwrap_or_default()
    }

    pub fn server_addr(&self) -> String {
        self.inner.lock().unwrap().meta.server_addr.clone()
    }

    pub fn status(&self) -> TabletStatus {
        self.inner.lock().unwrap().meta.status
    }

    pub fn data_size(&self) -> u64 {
        self.inner.lock().unwrap().meta.data_size
    }

    pub fn average_counter(&self) -> TabletCounter {
        self.inner.lock().unwrap().average
    }

    pub fn expect_server_addr(&self) -> String {
        self.inner.lock().unwrap().expect_server_addr.clone()
    }

    pub fn set_expect_server_addr(&self, addr: &str) {
        self.inner.lock().unwrap().expect_server_addr = addr.to_string();
    }

    pub fn load_time_ms(&self) -> u64 {
        self.inner.lock().unwrap().load_time_ms
    }

    pub fn mark_loaded(&self) {
        self.inner.lock().unwrap().load_time_ms = crate::unix_time_ms();
    }

    /// Unconditional-edge transition; still refuses edges outside the graph.
    pub fn set_status(&self, next: TabletStatus) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.meta.status.can_switch_to(next) {
            return false;
        }
        inner.meta.status = next;
        inner.update_time_ms = crate::unix_time_ms();
        true
    }

    /// Compare-and-swap transition: applies only from the expected status.
    pub fn set_status_if(&self, next: TabletStatus, expected: TabletStatus) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.meta.status != expected || !inner.meta.status.can_switch_to(next) {
            return false;
        }
        inner.meta.status = next;
        inner.update_time_ms = crate::unix_time_ms();
        true
    }

    pub fn set_addr(&self, addr: &str) {
        self.inner.lock().unwrap().meta.server_addr = addr.to_string();
    }

    /// Set address and transition in one critical section.
    pub fn set_addr_and_status_if(
        &self,
        addr: &str,
        next: TabletStatus,
        expected: TabletStatus,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.meta.status != expected || !inner.meta.status.can_switch_to(next) {
            return false;
        }
        inner.meta.server_addr = addr.to_string();
        inner.meta.status = next;
        inner.update_time_ms = crate::unix_time_ms();
        true
    }

    /// Fold a heartbeat report into sizes and the decayed load average.
    pub fn update_from_report(&self, reported: &TabletMeta, counter: &TabletCounter) {
        let mut inner = self.inner.lock().unwrap();
        inner.meta.data_size = reported.data_size;
        inner.meta.lg_size = reported.lg_size.clone();
        inner.meta.compact_status = reported.compact_status;
        inner.meta.counter = *counter;
        inner.average = TabletCounter {
            read_qps: counter_weighted_sum(inner.average.read_qps, counter.read_qps),
            write_qps: counter_weighted_sum(inner.average.write_qps, counter.write_qps),
            scan_qps: counter_weighted_sum(inner.average.scan_qps, counter.scan_qps),
            read_bytes: counter_weighted_sum(inner.average.read_bytes, counter.read_bytes),
            write_bytes: counter_weighted_sum(inner.average.write_bytes, counter.write_bytes),
            scan_bytes: counter_weighted_sum(inner.average.scan_bytes, counter.scan_bytes),
        };
    }

    pub fn add_snapshot(&self, snapshot: u64) {
        self.inner.lock().unwrap().meta.snapshots.push(snapshot);
    }

    pub fn del_snapshot(&self, snapshot: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.meta.snapshots.retain(|&s| s != snapshot);
    }

    pub fn snapshots(&self) -> Vec<u64> {
        self.inner.lock().unwrap().meta.snapshots.clone()
    }

    pub fn add_rollback(&self, rollback: Rollback) {
        self.inner.lock().unwrap().meta.rollbacks.push(rollback);
    }

    pub fn rollbacks(&self) -> Vec<Rollback> {
        self.inner.lock().unwrap().meta.rollbacks.clone()
    }

    /// Meta record for this tablet's current state.
    pub fn to_meta_record(&self) -> anyhow::Result<MetaRecord> {
        MetaRecord::for_tablet(&self.meta())
    }

    /// Meta record deleting this tablet's row.
    pub fn to_delete_record(&self) -> MetaRecord {
        let inner = self.inner.lock().unwrap();
        MetaRecord::delete(meta_codec::encode_tablet_key(
            &inner.meta.table_name,
            &inner.meta.key_range.start,
        ))
    }

    /// Check a node's report against the master's view of this tablet.
    pub fn verify_report(&self, reported: &TabletMeta) -> Result<(), StatusCode> {
        let inner = self.inner.lock().unwrap();
        if inner.meta.table_name != reported.table_name
            || inner.meta.key_range != reported.key_range
            || inner.meta.path != reported.path
        {
            return Err(StatusCode::KeyNotInRange);
        }
        if inner.meta.status == TabletStatus::Ready
            && inner.meta.server_addr != reported.server_addr
        {
            return Err(StatusCode::InvalidTransition);
        }
        Ok(())
    }
}

struct TableInner {
    meta: TableMeta,
    tablets: BTreeMap<Vec<u8>, Tablet>,
    deleted_tablet_count: u64,
    schema_is_syncing: bool,
    old_schema: Option<TableSchema>,
    sync_fragment: RangeFragment,
}

/// Shared handle to one table and its tablets.
#[derive(Clone)]
pub struct Table {
    inner: Arc<Mutex<TableInner>>,
}

impl Table {
    pub fn new(meta: TableMeta) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableInner {
                meta,
                tablets: BTreeMap::new(),
                deleted_tablet_count: 0,
                schema_is_syncing: false,
                old_schema: None,
                sync_fragment: RangeFragment::new(),
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.lock().unwrap().meta.name.clone()
    }

    pub fn meta(&self) -> TableMeta {
        self.inner.lock().unwrap().meta.clone()
    }

    pub fn status(&self) -> TableStatus {
        self.inner.lock().unwrap().meta.status
    }

    pub fn set_status(&self, next: TableStatus) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.meta.status.can_switch_to(next) {
            return false;
        }
        inner.meta.status = next;
        true
    }

    pub fn schema(&self) -> TableSchema {
        self.inner.lock().unwrap().meta.schema.clone()
    }

    pub fn set_schema(&self, schema: TableSchema) {
        self.inner.lock().unwrap().meta.schema = schema;
    }

    /// Allocate the next tablet directory number.
    pub fn next_tablet_num(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let num = inner.meta.next_tablet_num;
        inner.meta.next_tablet_num += 1;
        num
    }

    pub fn add_tablet(&self, tablet: Tablet) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let start = tablet.key_range().start;
        if inner.tablets.contains_key(&start) {
            return false;
        }
        inner.tablets.insert(start, tablet);
        true
    }

    pub fn remove_tablet(&self, start: &[u8]) -> Option<Tablet> {
        self.inner.lock().unwrap().tablets.remove(start)
    }

    pub fn find_tablet(&self, start: &[u8]) -> Option<Tablet> {
        self.inner.lock().unwrap().tablets.get(start).cloned()
    }

    /// Tablet whose range contains `key`: predecessor by start, then a
    /// containment check against its end.
    pub fn find_tablet_for_key(&self, key: &[u8]) -> Option<Tablet> {
        let inner = self.inner.lock().unwrap();
        let (_, tablet) = inner.tablets.range(..=key.to_vec()).next_back()?;
        tablet.key_range().contains(key).then(|| tablet.clone())
    }

    pub fn tablets(&self) -> Vec<Tablet> {
        self.inner.lock().unwrap().tablets.values().cloned().collect()
    }

    pub fn tablets_on_server(&self, addr: &str) -> Vec<Tablet> {
        self.inner
            .lock()
            .unwrap()
            .tablets
            .values()
            .filter(|t| t.server_addr() == addr)
            .cloned()
            .collect()
    }

    pub fn tablet_count(&self) -> usize {
        self.inner.lock().unwrap().tablets.len()
    }

    pub fn add_deleted_tablet_count(&self) {
        self.inner.lock().unwrap().deleted_tablet_count += 1;
    }

    /// A Deleting table is removable once every tablet reached Deleted.
    pub fn ready_for_removal(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.meta.status == TableStatus::Deleting
            && inner
                .tablets
                .values()
                .all(|t| t.status() == TabletStatus::Deleted)
    }

    pub fn schema_is_syncing(&self) -> bool {
        self.inner.lock().unwrap().schema_is_syncing
    }

    /// Begin an online schema update: stash the old schema and reset the
    /// coverage fragment. Fails if another update is in flight.
    pub fn prepare_update(&self, new_schema: TableSchema) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.schema_is_syncing {
            return false;
        }
        inner.schema_is_syncing = true;
        inner.old_schema = Some(inner.meta.schema.clone());
        inner.meta.schema = new_schema;
        inner.sync_fragment.reset();
        true
    }

    /// Record a per-tablet schema ack; true once coverage is complete.
    pub fn add_synced_range(&self, range: &KeyRange) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.sync_fragment.add_to_range(&range.start, &range.end);
        inner.sync_fragment.is_complete_range()
    }

    pub fn commit_update(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.schema_is_syncing = false;
        inner.old_schema = None;
        inner.sync_fragment.reset();
    }

    pub fn abort_update(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.old_schema.take() {
            inner.meta.schema = old;
        }
        inner.schema_is_syncing = false;
        inner.sync_fragment.reset();
    }

    pub fn to_meta_record(&self) -> anyhow::Result<MetaRecord> {
        MetaRecord::for_table(&self.meta())
    }

    pub fn add_snapshot(&self, snapshot: u64) {
        self.inner.lock().unwrap().meta.snapshots.push(snapshot);
    }

    pub fn del_snapshot(&self, snapshot: u64) {
        self.inner
            .lock()
            .unwrap()
            .meta
            .snapshots
            .retain(|&s| s != snapshot);
    }

    /// Live tablet numbers plus dead directory numbers found under the
    /// table's directory. Returns `None` while any tablet is mid-transition,
    /// since a moving tablet's inheritance set is not trustworthy.
    pub fn tablets_for_gc(&self, root: &Path) -> Option<(BTreeSet<u64>, BTreeSet<u64>)> {
        let inner = self.inner.lock().unwrap();
        let mut live = BTreeSet::new();
        for tablet in inner.tablets.values() {
            if tablet.status() != TabletStatus::Ready {
                return None;
            }
            live.insert(tablet.meta().tablet_num()?);
        }
        drop(inner);

        let mut dead = BTreeSet::new();
        let table_dir = root.join(self.name());
        if let Ok(entries) = std::fs::read_dir(&table_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let fake_path = format!("{}/{}", self.name(), name);
                if let Some((_, num)) = parse_tablet_path(&fake_path) {
                    if !live.contains(&num) {
                        dead.insert(num);
                    }
                }
            }
        }
        Some((live, dead))
    }
}

/// Catalog of every table (including the reserved meta table).
pub struct TabletManager {
    tables: Mutex<BTreeMap<String, Table>>,
}

impl TabletManager {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add_table(&self, table: Table) -> Result<(), StatusCode> {
        let mut tables = self.tables.lock().unwrap();
        let name = table.name();
        if tables.contains_key(&name) {
            return Err(StatusCode::TableExist);
        }
        tables.insert(name, table);
        Ok(())
    }

    pub fn find_table(&self, name: &str) -> Option<Table> {
        self.tables.lock().unwrap().get(name).cloned()
    }

    /// Resolve an alias installed by `rename` to the real table.
    pub fn resolve_table(&self, name_or_alias: &str) -> Option<Table> {
        let tables = self.tables.lock().unwrap();
        if let Some(table) = tables.get(name_or_alias) {
            return Some(table.clone());
        }
        tables
            .values()
            .find(|t| t.schema().alias.as_deref() == Some(name_or_alias))
            .cloned()
    }

    pub fn delete_table(&self, name: &str) -> Option<Table> {
        self.tables.lock().unwrap().remove(name)
    }

    pub fn find_tablet(&self, table: &str, start: &[u8]) -> Option<Tablet> {
        self.find_table(table)?.find_tablet(start)
    }

    /// All user tables, meta excluded, name order.
    pub fn user_tables(&self) -> Vec<Table> {
        self.tables
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name.as_str() != META_TABLE_NAME)
            .map(|(_, table)| table.clone())
            .collect()
    }

    pub fn all_tables(&self) -> Vec<Table> {
        self.tables.lock().unwrap().values().cloned().collect()
    }

    /// Every tablet currently attributed to `addr`.
    pub fn tablets_on_server(&self, addr: &str) -> Vec<Tablet> {
        self.all_tables()
            .into_iter()
            .flat_map(|table| table.tablets_on_server(addr))
            .collect()
    }

    pub fn all_tablet_count(&self) -> usize {
        self.all_tables().iter().map(|t| t.tablet_count()).sum()
    }

    /// Fraction of user tablets not currently serving.
    pub fn offline_tablet_ratio(&self) -> f64 {
        let mut total = 0usize;
        let mut offline = 0usize;
        for table in self.user_tables() {
            for tablet in table.tablets() {
                total += 1;
                if !tablet.status().is_serving() {
                    offline += 1;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            offline as f64 / total as f64
        }
    }

    /// Restore one table record read back from the meta tablet.
    pub fn load_table_meta(&self, value: &[u8]) -> anyhow::Result<()> {
        let meta = meta_codec::decode_table_value(value)?;
        let table = Table::new(meta);
        self.add_table(table)
            .map_err(|code| anyhow::anyhow!("duplicate table record: {code}"))
    }

    /// Restore one tablet record read back from the meta tablet.
    ///
    /// Tablets come back Offline regardless of their recorded status; the
    /// restore path reconciles them against live node reports afterwards.
    pub fn load_tablet_meta(&self, value: &[u8]) -> anyhow::Result<()> {
        let mut meta = meta_codec::decode_tablet_value(value)?;
        meta.status = TabletStatus::Offline;
        let table = self
            .find_table(&meta.table_name)
            .ok_or_else(|| anyhow::anyhow!("tablet record for unknown table {}", meta.table_name))?;
        anyhow::ensure!(
            table.add_tablet(Tablet::new(meta.clone())),
            "duplicate tablet record at {:?}",
            meta.key_range
        );
        Ok(())
    }

    /// Verify the invariant that an enabled table's tablets cover ["", "")
    /// with no gaps or overlaps. Returns the offending start key on failure.
    pub fn check_table_coverage(&self, table: &Table) -> Result<(), Vec<u8>> {
        let tablets = table.tablets();
        let mut expected: Vec<u8> = Vec::new();
        for (idx, tablet) in tablets.iter().enumerate() {
            let range = tablet.key_range();
            if range.start != expected {
                return Err(range.start);
            }
            if idx + 1 == tablets.len() {
                if !range.end.is_empty() {
                    return Err(range.end);
                }
            } else if range.end.is_empty() || range.end <= range.start {
                return Err(range.start);
            }
            expected = range.end;
        }
        if tablets.is_empty() {
            return Err(Vec::new());
        }
        Ok(())
    }

    /// Choose a merge partner for `tablet`: the smaller adjacent neighbor,
    /// both Ready, same table.
    pub fn pick_merge_pair(&self, tablet: &Tablet) -> Option<(Tablet, Tablet)> {
        let table = self.find_table(&tablet.table_name())?;
        let range = tablet.key_range();
        let tablets = table.tablets();
        let idx = tablets
            .iter()
            .position(|t| t.key_range().start == range.start)?;
        let left = (idx > 0).then(|| tablets[idx - 1].clone());
        let right = tablets.get(idx + 1).cloned();

        let eligible = |t: &Tablet| t.status() == TabletStatus::Ready;
        let mut candidates: Vec<(Tablet, Tablet)> = Vec::new();
        if let Some(left) = left.filter(eligible) {
            candidates.push((left, tablet.clone()));
        }
        if let Some(right) = right.filter(eligible) {
            candidates.push((tablet.clone(), right.clone()));
        }
        candidates.sort_by_key(|(a, b)| a.data_size().min(b.data_size()));
        candidates.into_iter().next()
    }
}

impl Default for TabletManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::tablet_path;

    fn tablet(table: &str, num: u64, start: &[u8], end: &[u8]) -> Tablet {
        Tablet::new(TabletMeta {
            table_name: table.to_string(),
            path: tablet_path(table, num),
            key_range: KeyRange::new(start, end),
            status: TabletStatus::Offline,
            ..Default::default()
        })
    }

    fn table_with_tablets(name: &str, bounds: &[(&[u8], &[u8])]) -> Table {
        let mut meta = TableMeta::new(TableSchema::kv(name), 0);
        meta.status = TableStatus::Enable;
        let table = Table::new(meta);
        for (idx, (start, end)) in bounds.iter().enumerate() {
            assert!(table.add_tablet(tablet(name, idx as u64 + 1, start, end)));
        }
        table
    }

    #[test]
    fn find_tablet_for_key_uses_predecessor_with_containment() {
        let table = table_with_tablets("t", &[(b"", b"g"), (b"g", b"p"), (b"p", b"")]);
        assert_eq!(
            table.find_tablet_for_key(b"a").unwrap().key_range(),
            KeyRange::new(&b""[..], &b"g"[..])
        );
        assert_eq!(
            table.find_tablet_for_key(b"g").unwrap().key_range(),
            KeyRange::new(&b"g"[..], &b"p"[..])
        );
        assert_eq!(
            table.find_tablet_for_key(b"zzz").unwrap().key_range(),
            KeyRange::new(&b"p"[..], &b""[..])
        );
    }

    #[test]
    fn stale_callback_cannot_regress_status() {
        let t = tablet("t", 1, b"", b"");
        assert!(t.set_status_if(TabletStatus::WaitLoad, TabletStatus::Offline));
        assert!(t.set_status_if(TabletStatus::OnLoad, TabletStatus::WaitLoad));
        assert!(t.set_status_if(TabletStatus::Ready, TabletStatus::OnLoad));
        // A stale load-fail completion arrives after the tablet went Ready.
        assert!(!t.set_status_if(TabletStatus::LoadFail, TabletStatus::OnLoad));
        assert_eq!(t.status(), TabletStatus::Ready);
    }

    #[test]
    fn coverage_check_flags_gap_and_overlap() {
        let manager = TabletManager::new();
        let good = table_with_tablets("good", &[(b"", b"m"), (b"m", b"")]);
        assert!(manager.check_table_coverage(&good).is_ok());

        let gap = table_with_tablets("gap", &[(b"", b"g"), (b"h", b"")]);
        assert_eq!(manager.check_table_coverage(&gap), Err(b"h".to_vec()));

        let overlap = table_with_tablets("overlap", &[(b"", b"m"), (b"k", b"")]);
        assert_eq!(manager.check_table_coverage(&overlap), Err(b"k".to_vec()));

        let truncated = table_with_tablets("trunc", &[(b"", b"m"), (b"m", b"x")]);
        assert_eq!(manager.check_table_coverage(&truncated), Err(b"x".to_vec()));
    }

    #[test]
    fn merge_pair_prefers_smaller_adjacent_neighbor() {
        let manager = TabletManager::new();
        let table = table_with_tablets("t", &[(b"", b"g"), (b"g", b"p"), (b"p", b"")]);
        manager.add_table(table.clone()).unwrap();
        for t in table.tablets() {
            assert!(t.set_status_if(TabletStatus::WaitLoad, TabletStatus::Offline));
            assert!(t.set_status_if(TabletStatus::OnLoad, TabletStatus::WaitLoad));
            assert!(t.set_status_if(TabletStatus::Ready, TabletStatus::OnLoad));
        }
        let middle = table.find_tablet(b"g").unwrap();
        let (left, right) = manager.pick_merge_pair(&middle).unwrap();
        assert!(left.key_range().is_left_neighbor_of(&right.key_range()));
    }

    #[test]
    fn deleting_table_waits_for_all_tablets_deleted() {
        let table = table_with_tablets("t", &[(b"", b"")]);
        assert!(table.set_status(TableStatus::Disable));
        assert!(table.set_status(TableStatus::Deleting));
        assert!(!table.ready_for_removal());
        for t in table.tablets() {
            assert!(t.set_status_if(TabletStatus::Deleted, TabletStatus::Offline));
        }
        assert!(table.ready_for_removal());
    }

    #[test]
    fn schema_update_tracks_fragment_coverage() {
        let table = table_with_tablets("t", &[(b"", b"m"), (b"m", b"")]);
        let mut schema = table.schema();
        schema.column_families.push(Default::default());
        assert!(table.prepare_update(schema));
        assert!(table.schema_is_syncing());
        assert!(!table.add_synced_range(&KeyRange::new(&b""[..], &b"m"[..])));
        assert!(table.add_synced_range(&KeyRange::new(&b"m"[..], &b""[..])));
        table.commit_update();
        assert!(!table.schema_is_syncing());
    }
}
