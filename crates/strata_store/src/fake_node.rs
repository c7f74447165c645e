//! In-memory tablet-server fake for unit tests: serves any table as a plain
//! sorted map and lets tests inject routing faults.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::rpc::*;
use crate::status::StatusCode;

#[derive(Default)]
pub struct FakeMetaNode {
    rows: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    reject_with_key_not_in_range: AtomicBool,
}

impl FakeMetaNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.rows.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: Vec<u8>, value: Vec<u8>) {
        self.rows.lock().unwrap().insert(key, value);
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Make subsequent writes/reads/scans fail with `KeyNotInRange`.
    pub fn set_reject(&self, reject: bool) {
        self.reject_with_key_not_in_range
            .store(reject, Ordering::Relaxed);
    }

    fn rejecting(&self) -> bool {
        self.reject_with_key_not_in_range.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TabletNodeRpc for FakeMetaNode {
    async fn load_tablet(&self, request: LoadTabletRequest) -> LoadTabletResponse {
        LoadTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::Ok,
        }
    }

    async fn unload_tablet(&self, request: UnloadTabletRequest) -> UnloadTabletResponse {
        UnloadTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::Ok,
        }
    }

    async fn split_tablet(&self, request: SplitTabletRequest) -> SplitTabletResponse {
        SplitTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::Ok,
            split_key: Vec::new(),
        }
    }

    async fn compact_tablet(&self, request: CompactTabletRequest) -> CompactTabletResponse {
        CompactTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::Ok,
            data_size: 0,
        }
    }

    async fn write_tablet(&self, request: WriteTabletRequest) -> WriteTabletResponse {
        if self.rejecting() {
            return WriteTabletResponse {
                sequence_id: request.sequence_id,
                status: StatusCode::KeyNotInRange,
                row_status: Vec::new(),
            };
        }
        let mut rows = self.rows.lock().unwrap();
        let mut row_status = Vec::with_capacity(request.rows.len());
        for mutation in &request.rows {
            for op in &mutation.ops {
                match op.kind {
                    MutationKind::Put => {
                        rows.insert(mutation.row.clone(), op.value.clone());
                    }
                    MutationKind::DeleteRow | MutationKind::DeleteColumn => {
                        rows.remove(&mutation.row);
                    }
                }
            }
            row_status.push(StatusCode::Ok);
        }
        WriteTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::Ok,
            row_status,
        }
    }

    async fn read_tablet(&self, request: ReadTabletRequest) -> ReadTabletResponse {
        if self.rejecting() {
            return ReadTabletResponse {
                sequence_id: request.sequence_id,
                status: StatusCode::KeyNotInRange,
                rows: Vec::new(),
            };
        }
        let rows = self.rows.lock().unwrap();
        let results = request
            .rows
            .iter()
            .map(|row| match rows.get(row) {
                Some(value) => RowReadResult {
                    status: StatusCode::Ok,
                    value: value.clone(),
                },
                None => RowReadResult {
                    status: StatusCode::NotFound,
                    value: Vec::new(),
                },
            })
            .collect();
        ReadTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::Ok,
            rows: results,
        }
    }

    async fn scan_tablet(&self, request: ScanTabletRequest) -> ScanTabletResponse {
        if self.rejecting() {
            return ScanTabletResponse {
                sequence_id: request.sequence_id,
                status: StatusCode::KeyNotInRange,
                complete: true,
                entries: Vec::new(),
            };
        }
        let rows = self.rows.lock().unwrap();
        let scan_start = if request.round_down {
            rows.range(..=request.start.clone())
                .next_back()
                .map(|(key, _)| key.clone())
                .unwrap_or_else(|| request.start.clone())
        } else {
            request.start.clone()
        };
        let mut entries = Vec::new();
        let mut remaining = 0usize;
        for (key, value) in rows.range(scan_start..) {
            if !request.end.is_empty() && key.as_slice() >= request.end.as_slice() {
                break;
            }
            if request.max_entries > 0 && entries.len() >= request.max_entries {
                remaining += 1;
                continue;
            }
            entries.push(KeyValue {
                key: key.clone(),
                value: value.clone(),
            });
        }
        ScanTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::Ok,
            complete: remaining == 0,
            entries,
        }
    }

    async fn query(&self, request: QueryRequest) -> QueryResponse {
        QueryResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::Ok,
            tablets: Vec::new(),
            inherited: Vec::new(),
            stat: NodeStat::default(),
        }
    }

    async fn update_schema(&self, request: UpdateSchemaRequest) -> UpdateSchemaResponse {
        UpdateSchemaResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::Ok,
            acked_ranges: Vec::new(),
        }
    }

    async fn snapshot_tablet(&self, request: SnapshotTabletRequest) -> SnapshotTabletResponse {
        SnapshotTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::Ok,
            snapshot_point: 0,
        }
    }

    async fn rollback_tablet(&self, request: RollbackTabletRequest) -> RollbackTabletResponse {
        RollbackTabletResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::Ok,
            rollback_point: 0,
        }
    }
}
