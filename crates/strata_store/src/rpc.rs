//! RPC seam between master, tablet servers, and clients.
//!
//! The wire transport is out of scope: requests and responses are plain
//! serde structs, servers implement `TabletNodeRpc`, and callers resolve an
//! address through an `RpcRouter` injected at init. A missing address is the
//! moral equivalent of a connection failure and is reported as
//! `StatusCode::ConnectError` by the calling side.
//!
//! Every master-issued request carries a `sequence_id`; responses echo it so
//! stale completions can be discarded against the master's current view.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::meta::{KeyRange, Rollback, TableSchema, TabletCounter, TabletMeta};
use crate::status::StatusCode;

/// Name of the reserved meta table.
pub const META_TABLE_NAME: &str = "meta";

/// Monotonic sequence-id source shared by one master incarnation.
#[derive(Debug, Default)]
pub struct SequenceId {
    next: AtomicU64,
}

impl SequenceId {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTabletRequest {
    pub sequence_id: u64,
    pub tablet: TabletMeta,
    pub schema: TableSchema,
    pub lineage: Vec<u64>,
    pub snapshots: Vec<u64>,
    pub rollbacks: Vec<Rollback>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTabletResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloadTabletRequest {
    pub sequence_id: u64,
    pub table_name: String,
    pub key_start: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloadTabletResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitTabletRequest {
    pub sequence_id: u64,
    pub table_name: String,
    pub key_start: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitTabletResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub split_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactTabletRequest {
    pub sequence_id: u64,
    pub table_name: String,
    pub key_start: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactTabletResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub data_size: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MutationKind {
    Put,
    DeleteRow,
    DeleteColumn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationOp {
    pub kind: MutationKind,
    pub family: String,
    pub qualifier: Vec<u8>,
    /// Explicit cell timestamp; `None` lets the engine assign one.
    pub timestamp: Option<u64>,
    pub value: Vec<u8>,
}

impl MutationOp {
    pub fn put(value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MutationKind::Put,
            family: String::new(),
            qualifier: Vec::new(),
            timestamp: None,
            value: value.into(),
        }
    }

    pub fn delete_row() -> Self {
        Self {
            kind: MutationKind::DeleteRow,
            family: String::new(),
            qualifier: Vec::new(),
            timestamp: None,
            value: Vec::new(),
        }
    }
}

/// All mutations for one row; applied atomically and in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowMutation {
    pub row: Vec<u8>,
    pub ops: Vec<MutationOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteTabletRequest {
    pub sequence_id: u64,
    pub table_name: String,
    pub rows: Vec<RowMutation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteTabletResponse {
    pub sequence_id: u64,
    /// Table-level status; per-row statuses refine it when present.
    pub status: StatusCode,
    pub row_status: Vec<StatusCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadTabletRequest {
    pub sequence_id: u64,
    pub table_name: String,
    pub rows: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowReadResult {
    pub status: StatusCode,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadTabletResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub rows: Vec<RowReadResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTabletRequest {
    pub sequence_id: u64,
    pub table_name: String,
    /// Raw storage keys: meta keys for the meta table, cell keys otherwise.
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub max_entries: usize,
    /// Include the greatest row at or before `start`. Meta lookups need the
    /// record of the tablet covering `start`, which sorts at the tablet's
    /// own start key, before `start` itself.
    pub round_down: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTabletResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub complete: bool,
    pub entries: Vec<KeyValue>,
}

/// One tablet's heartbeat report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletReport {
    pub meta: TabletMeta,
    pub counter: TabletCounter,
}

/// Files still read from a dead ancestor's directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InheritedAncestor {
    pub ancestor: u64,
    pub files: Vec<String>,
}

/// Per-table inheritance section of a GC query response. Present for every
/// table the node serves, even with no ancestors: its presence is what marks
/// the table's report as complete for that round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InheritedLiveFiles {
    pub table_name: String,
    pub ancestors: Vec<InheritedAncestor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStat {
    pub tablet_count: u64,
    pub data_size: u64,
    pub load_weight: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sequence_id: u64,
    /// When set, the response must include inheritance reports for GC.
    pub is_gc: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub tablets: Vec<TabletReport>,
    pub inherited: Vec<InheritedLiveFiles>,
    pub stat: NodeStat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSchemaRequest {
    pub sequence_id: u64,
    pub table_name: String,
    pub schema: TableSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSchemaResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    /// Ranges of this node's tablets that now run the new schema.
    pub acked_ranges: Vec<KeyRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTabletRequest {
    pub sequence_id: u64,
    pub table_name: String,
    pub key_start: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTabletResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub snapshot_point: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackTabletRequest {
    pub sequence_id: u64,
    pub table_name: String,
    pub key_start: Vec<u8>,
    pub snapshot_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackTabletResponse {
    pub sequence_id: u64,
    pub status: StatusCode,
    pub rollback_point: u64,
}

/// Service surface of one tablet server.
#[async_trait]
pub trait TabletNodeRpc: Send + Sync {
    async fn load_tablet(&self, request: LoadTabletRequest) -> LoadTabletResponse;
    async fn unload_tablet(&self, request: UnloadTabletRequest) -> UnloadTabletResponse;
    async fn split_tablet(&self, request: SplitTabletRequest) -> SplitTabletResponse;
    async fn compact_tablet(&self, request: CompactTabletRequest) -> CompactTabletResponse;
    async fn write_tablet(&self, request: WriteTabletRequest) -> WriteTabletResponse;
    async fn read_tablet(&self, request: ReadTabletRequest) -> ReadTabletResponse;
    async fn scan_tablet(&self, request: ScanTabletRequest) -> ScanTabletResponse;
    async fn query(&self, request: QueryRequest) -> QueryResponse;
    async fn update_schema(&self, request: UpdateSchemaRequest) -> UpdateSchemaResponse;
    async fn snapshot_tablet(&self, request: SnapshotTabletRequest) -> SnapshotTabletResponse;
    async fn rollback_tablet(&self, request: RollbackTabletRequest) -> RollbackTabletResponse;
}

/// Address → server map, injected wherever outbound RPCs are made.
///
/// Process-wide explicit state instead of a module-level singleton; in a
/// networked deployment this is where a connection pool would live.
#[derive(Clone, Default)]
pub struct RpcRouter {
    nodes: Arc<RwLock<HashMap<String, Arc<dyn TabletNodeRpc>>>>,
}

impl RpcRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: &str, node: Arc<dyn TabletNodeRpc>) {
        self.nodes.write().unwrap().insert(addr.to_string(), node);
    }

    pub fn unregister(&self, addr: &str) {
        self.nodes.write().unwrap().remove(addr);
    }

    /// Resolve an address; `None` reads as a connection failure.
    pub fn node(&self, addr: &str) -> Option<Arc<dyn TabletNodeRpc>> {
        self.nodes.read().unwrap().get(addr).cloned()
    }

    pub fn addrs(&self) -> Vec<String> {
        self.nodes.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_ids_are_monotonic() {
        let seq = SequenceId::new();
        let a = seq.next();
        let b = seq.next();
        assert!(b > a);
        assert_eq!(seq.current(), b);
    }

    #[test]
    fn router_resolves_registered_addresses_only() {
        let router = RpcRouter::new();
        assert!(router.node("ts1:7777").is_none());
    }
}
