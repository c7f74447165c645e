//! Table/tablet metadata value objects and their status state machines.
//!
//! Everything here round-trips through the meta table (see `meta_codec`), so
//! all types derive `Serialize`/`Deserialize` and keep stable field names.

use serde::{Deserialize, Serialize};

/// How raw keys are interpreted by the storage layer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RawKeyMode {
    #[default]
    Binary,
    Readable,
    TtlKv,
    GeneralKv,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompressType {
    #[default]
    None,
    Lz4,
}

/// A disjoint set of column families sharing one LSM instance per tablet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalityGroupSchema {
    pub name: String,
    pub compress: CompressType,
    pub block_size_kb: u32,
}

impl Default for LocalityGroupSchema {
    fn default() -> Self {
        Self {
            name: "lg0".to_string(),
            compress: CompressType::default(),
            block_size_kb: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnFamilySchema {
    pub name: String,
    pub locality_group: String,
    pub max_versions: u32,
    /// Zero means no TTL.
    pub ttl_secs: u64,
}

impl Default for ColumnFamilySchema {
    fn default() -> Self {
        Self {
            name: String::new(),
            locality_group: "lg0".to_string(),
            max_versions: 1,
            ttl_secs: 0,
        }
    }
}

/// Full table schema: raw-key mode plus locality-group/column-family layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub raw_key: RawKeyMode,
    pub locality_groups: Vec<LocalityGroupSchema>,
    pub column_families: Vec<ColumnFamilySchema>,
    /// Optional alias installed by `rename`; resolved before routing.
    #[serde(default)]
    pub alias: Option<String>,
}

impl TableSchema {
    /// Plain key/value schema: a single default locality group, no column families.
    pub fn kv(name: &str) -> Self {
        Self {
            name: name.to_string(),
            raw_key: RawKeyMode::Binary,
            locality_groups: vec![LocalityGroupSchema::default()],
            column_families: Vec::new(),
            alias: None,
        }
    }

    /// Locality group index for a column family; default group when unknown.
    pub fn lg_index_for_family(&self, family: &str) -> usize {
        let lg_name = self
            .column_families
            .iter()
            .find(|cf| cf.name == family)
            .map(|cf| cf.locality_group.as_str())
            .unwrap_or("lg0");
        self.locality_groups
            .iter()
            .position(|lg| lg.name == lg_name)
            .unwrap_or(0)
    }

    /// Whether `other` differs only in non-structural fields (versions, TTL).
    ///
    /// Structural changes (locality groups, column-family membership) require
    /// the table to be disabled when online schema update is off.
    pub fn is_structural_change(&self, other: &TableSchema) -> bool {
        if self.locality_groups != other.locality_groups {
            return true;
        }
        let mine: Vec<(&str, &str)> = self
            .column_families
            .iter()
            .map(|cf| (cf.name.as_str(), cf.locality_group.as_str()))
            .collect();
        let theirs: Vec<(&str, &str)> = other
            .column_families
            .iter()
            .map(|cf| (cf.name.as_str(), cf.locality_group.as_str()))
            .collect();
        mine != theirs
    }
}

/// Half-open key interval [start, end). Empty bytes mean the infinitesimal:
/// start = "" is -inf, end = "" is +inf.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The full keyspace ["", "").
    pub fn whole() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        (self.start.is_empty() || key >= self.start.as_slice())
            && (self.end.is_empty() || key < self.end.as_slice())
    }

    pub fn is_whole(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    /// Whether `self` directly precedes `other` with no gap.
    pub fn is_left_neighbor_of(&self, other: &KeyRange) -> bool {
        !self.end.is_empty() && self.end == other.start
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            String::from_utf8_lossy(&self.start),
            String::from_utf8_lossy(&self.end)
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TableStatus {
    #[default]
    NotInit,
    Enable,
    Disable,
    Deleting,
}

impl TableStatus {
    /// Fixed edge table for table lifecycle transitions.
    pub fn can_switch_to(self, next: TableStatus) -> bool {
        use TableStatus::*;
        matches!(
            (self, next),
            (NotInit, Enable) | (Enable, Disable) | (Disable, Enable) | (Disable, Deleting)
        )
    }
}

/// Per-tablet lifecycle status. Any transition not present in
/// `can_switch_to` must be rejected leaving the state unchanged.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TabletStatus {
    #[default]
    NotInit,
    Ready,
    OnLoad,
    OnSplit,
    OnMerge,
    Unloading,
    Unloaded,
    Splited,
    LoadFail,
    UnLoadFail,
    SplitFail,
    Offline,
    Pending,
    WaitLoad,
    WaitSplit,
    Deleted,
}

impl TabletStatus {
    /// The fixed directed graph of allowed status transitions.
    pub fn can_switch_to(self, next: TabletStatus) -> bool {
        use TabletStatus::*;
        match self {
            NotInit => matches!(next, Offline | Ready),
            Offline => matches!(next, WaitLoad | OnLoad | Pending | Deleted),
            WaitLoad => matches!(next, OnLoad | Pending | Deleted),
            Pending => matches!(next, WaitLoad | OnLoad | Deleted),
            OnLoad => matches!(next, Ready | LoadFail | WaitLoad | Offline),
            LoadFail => matches!(next, OnLoad | WaitLoad | Pending | Offline),
            Ready => matches!(next, OnSplit | OnMerge | Unloading | WaitSplit | Offline),
            WaitSplit => matches!(next, OnSplit | Ready | Unloading),
            OnSplit => matches!(next, Splited | SplitFail | Ready),
            SplitFail => matches!(next, OnSplit | Unloading | Offline),
            Splited => matches!(next, Deleted),
            OnMerge => matches!(next, Unloaded | UnLoadFail | Offline | Ready),
            Unloading => matches!(next, Unloaded | UnLoadFail | Offline),
            UnLoadFail => matches!(next, Unloading | Offline),
            Unloaded => matches!(next, Offline | OnLoad | Deleted),
            Deleted => false,
        }
    }

    /// Whether a tablet in this status is being served by some node.
    pub fn is_serving(self) -> bool {
        matches!(
            self,
            TabletStatus::Ready
                | TabletStatus::OnSplit
                | TabletStatus::OnMerge
                | TabletStatus::WaitSplit
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompactStatus {
    #[default]
    NotCompact,
    OnCompact,
    Compacted,
}

/// QPS/byte counters reported by the serving node each query round.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabletCounter {
    pub read_qps: u64,
    pub write_qps: u64,
    pub scan_qps: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub scan_bytes: u64,
}

impl TabletCounter {
    pub fn load_weight(&self) -> u64 {
        self.read_qps + self.write_qps + self.scan_qps
    }
}

/// A named rollback point over a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rollback {
    pub name: String,
    pub snapshot_id: u64,
    pub rollback_point: u64,
}

/// Persistent record describing one tablet: a contiguous key range of a table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabletMeta {
    pub table_name: String,
    /// `<table>/tablet<num>`, zero-padded; encodes no lineage (see `parents`).
    pub path: String,
    pub key_range: KeyRange,
    pub server_addr: String,
    pub status: TabletStatus,
    pub data_size: u64,
    pub lg_size: Vec<u64>,
    pub compact_status: CompactStatus,
    pub snapshots: Vec<u64>,
    pub rollbacks: Vec<Rollback>,
    /// Ancestor tablet numbers this tablet may still inherit SST files from.
    pub parents: Vec<u64>,
    #[serde(default)]
    pub counter: TabletCounter,
}

impl TabletMeta {
    pub fn tablet_num(&self) -> Option<u64> {
        parse_tablet_path(&self.path).map(|(_, num)| num)
    }
}

/// Persistent record describing one table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableMeta {
    pub name: String,
    pub status: TableStatus,
    pub schema: TableSchema,
    pub snapshots: Vec<u64>,
    pub rollback_names: Vec<String>,
    pub create_time_ms: u64,
    /// Monotonic allocator for tablet directory numbers.
    pub next_tablet_num: u64,
}

impl TableMeta {
    pub fn new(schema: TableSchema, create_time_ms: u64) -> Self {
        Self {
            name: schema.name.clone(),
            status: TableStatus::NotInit,
            schema,
            snapshots: Vec::new(),
            rollback_names: Vec::new(),
            create_time_ms,
            next_tablet_num: 1,
        }
    }
}

/// User record kept under the reserved meta prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserMeta {
    pub name: String,
    pub token: String,
    pub groups: Vec<String>,
}

/// Build a tablet directory path: `<table>/tablet<num>` with a zero-padded num.
pub fn tablet_path(table: &str, num: u64) -> String {
    format!("{table}/tablet{num:08}")
}

/// Parse `<table>/tablet<num>` back into its components.
pub fn parse_tablet_path(path: &str) -> Option<(&str, u64)> {
    let (table, dir) = path.rsplit_once('/')?;
    let num = dir.strip_prefix("tablet")?.parse().ok()?;
    Some((table, num))
}

/// Valid table names: non-empty ASCII `[A-Za-z0-9_.-]`, not starting with a
/// reserved meta prefix byte. This keeps the documented meta scan order
/// (table records before tablet records before user records).
pub fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_range_containment_with_open_ends() {
        let whole = KeyRange::whole();
        assert!(whole.contains(b""));
        assert!(whole.contains(b"\xff\xff"));

        let mid = KeyRange::new(&b"b"[..], &b"d"[..]);
        assert!(mid.contains(b"b"));
        assert!(mid.contains(b"c"));
        assert!(!mid.contains(b"d"));
        assert!(!mid.contains(b"a"));

        let tail = KeyRange::new(&b"x"[..], &b""[..]);
        assert!(tail.contains(b"zzzz"));
        assert!(!tail.contains(b"w"));
    }

    #[test]
    fn tablet_status_rejects_unknown_edges() {
        use TabletStatus::*;
        // Happy path: created offline, loaded, split.
        assert!(Offline.can_switch_to(WaitLoad));
        assert!(WaitLoad.can_switch_to(OnLoad));
        assert!(OnLoad.can_switch_to(Ready));
        assert!(Ready.can_switch_to(OnSplit));
        assert!(OnSplit.can_switch_to(Splited));
        assert!(Splited.can_switch_to(Deleted));

        // Failure sinks retry.
        assert!(OnLoad.can_switch_to(LoadFail));
        assert!(LoadFail.can_switch_to(OnLoad));
        assert!(LoadFail.can_switch_to(Pending));

        // Disallowed edges.
        assert!(!Ready.can_switch_to(Ready));
        assert!(!Deleted.can_switch_to(Offline));
        assert!(!Offline.can_switch_to(Ready));
        assert!(!Unloaded.can_switch_to(Ready));
        assert!(!Ready.can_switch_to(OnLoad));
    }

    #[test]
    fn table_status_lifecycle() {
        use TableStatus::*;
        assert!(NotInit.can_switch_to(Enable));
        assert!(Enable.can_switch_to(Disable));
        assert!(Disable.can_switch_to(Enable));
        assert!(Disable.can_switch_to(Deleting));
        assert!(!Enable.can_switch_to(Deleting));
        assert!(!Deleting.can_switch_to(Enable));
    }

    #[test]
    fn tablet_path_round_trip() {
        let path = tablet_path("orders", 42);
        assert_eq!(path, "orders/tablet00000042");
        assert_eq!(parse_tablet_path(&path), Some(("orders", 42)));
        assert_eq!(parse_tablet_path("orders/zzz"), None);
        assert_eq!(parse_tablet_path("tablet00000001"), None);
    }

    #[test]
    fn structural_schema_change_detection() {
        let base = TableSchema::kv("t");
        let mut versions_only = base.clone();
        versions_only.column_families = vec![ColumnFamilySchema {
            name: "cf".into(),
            ..Default::default()
        }];
        let mut with_cf = base.clone();
        with_cf.column_families = versions_only.column_families.clone();

        assert!(base.is_structural_change(&with_cf));

        let mut bumped = with_cf.clone();
        bumped.column_families[0].max_versions = 9;
        assert!(!with_cf.is_structural_change(&bumped));
    }
}
