//! Tablet server: registration, watches, and the serving-tablet map.
//!
//! On startup the node creates its ephemeral `/ts/<session>#<seq>` node and
//! watches four things: its own registration (deleted -> self-exit), its kick
//! mark (created -> self-exit), `/safemode` (observability only; the data
//! plane keeps serving), and `/root-tablet-addr` (in-memory pointer). Session
//! loss terminates the serving role outright; there is no re-join.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::coordination::{
    kick_path_for, ts_node_prefix, Coordination, WatchEvent, WatchEventKind, ROOT_TABLET_PATH,
    SAFEMODE_PATH,
};
use crate::meta::{KeyRange, TableSchema, TabletCounter, TabletMeta, TabletStatus};
use crate::rpc::*;
use crate::status::StatusCode;
use crate::tablet_io::{CellKind, KeyspaceCache, TabletIo};

#[derive(Debug, Clone)]
pub struct TabletNodeConfig {
    pub addr: String,
    /// Shared filesystem root holding every tablet directory.
    pub root_dir: PathBuf,
    pub scan_page: usize,
}

impl TabletNodeConfig {
    pub fn new(addr: &str, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            addr: addr.to_string(),
            root_dir: root_dir.into(),
            scan_page: 1024,
        }
    }
}

#[derive(Default)]
struct OpCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    scans: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    scan_bytes: AtomicU64,
}

impl OpCounters {
    /// Drain accumulated counts into a counter sample.
    fn take(&self) -> TabletCounter {
        TabletCounter {
            read_qps: self.reads.swap(0, Ordering::Relaxed),
            write_qps: self.writes.swap(0, Ordering::Relaxed),
            scan_qps: self.scans.swap(0, Ordering::Relaxed),
            read_bytes: self.read_bytes.swap(0, Ordering::Relaxed),
            write_bytes: self.write_bytes.swap(0, Ordering::Relaxed),
            scan_bytes: self.scan_bytes.swap(0, Ordering::Relaxed),
        }
    }
}

struct ServingTablet {
    io: Arc<TabletIo>,
    /// Current schema as acked to the master; new cells map through the
    /// schema the tablet was loaded with until the next load.
    schema: Mutex<TableSchema>,
    counters: OpCounters,
}

pub struct TabletNodeImpl {
    config: TabletNodeConfig,
    coord: Arc<dyn Coordination>,
    cache: KeyspaceCache,
    /// (table, range start) -> serving entry; BTreeMap gives range lookup.
    serving: Mutex<BTreeMap<(String, Vec<u8>), Arc<ServingTablet>>>,
    root_tablet_addr: Mutex<String>,
    safe_mode: AtomicBool,
    running: AtomicBool,
    registration_path: Mutex<String>,
}

impl TabletNodeImpl {
    /// Register with the coordination service and start watch handlers.
    pub fn start(
        config: TabletNodeConfig,
        coord: Arc<dyn Coordination>,
        router: &RpcRouter,
    ) -> anyhow::Result<Arc<Self>> {
        let node = Arc::new(Self {
            cache: KeyspaceCache::new(),
            serving: Mutex::new(BTreeMap::new()),
            root_tablet_addr: Mutex::new(String::new()),
            safe_mode: AtomicBool::new(false),
            running: AtomicBool::new(true),
            registration_path: Mutex::new(String::new()),
            config,
            coord,
        });

        let session = node.coord.session_id();
        let path = node
            .coord
            .create_sequential_ephemeral(&ts_node_prefix(&session), node.config.addr.as_bytes())?;
        tracing::info!(addr = %node.config.addr, path = %path, "tablet server registered");
        *node.registration_path.lock().unwrap() = path.clone();

        let (tx, rx) = mpsc::unbounded_channel::<WatchEvent>();
        // Self node: deletion means the cluster no longer knows us.
        let self_exists = node.coord.check_and_watch_exist(&path, tx.clone())?;
        if !self_exists {
            anyhow::bail!("registration node vanished before watch");
        }
        // Kick mark for this registration.
        let node_name = path.rsplit('/').next().unwrap_or_default().to_string();
        let kick_path = kick_path_for(&node_name);
        if node.coord.check_and_watch_exist(&kick_path, tx.clone())? {
            anyhow::bail!("kick mark already present for {node_name}");
        }
        // Safe mode marker.
        let in_safe_mode = node.coord.check_and_watch_exist(SAFEMODE_PATH, tx.clone())?;
        node.safe_mode.store(in_safe_mode, Ordering::Relaxed);
        // Root tablet address.
        if let Some(value) = node.coord.read_and_watch(ROOT_TABLET_PATH, tx.clone())? {
            *node.root_tablet_addr.lock().unwrap() =
                String::from_utf8_lossy(&value).to_string();
        }
        node.coord.watch_session(tx);

        node.clone()
            .spawn_watch_handler(rx, path, kick_path, router.clone());
        router.register(&node.config.addr, node.clone());
        Ok(node)
    }

    fn spawn_watch_handler(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<WatchEvent>,
        self_path: String,
        kick_path: String,
        router: RpcRouter,
    ) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match (&event.kind, event.path.as_str()) {
                    (WatchEventKind::SessionLost, _) => {
                        tracing::error!(addr = %self.config.addr, "session lost; exiting");
                        self.shutdown(&router);
                        break;
                    }
                    (WatchEventKind::Deleted, path) if path == self_path => {
                        tracing::error!(addr = %self.config.addr, "registration deleted; exiting");
                        self.shutdown(&router);
                        break;
                    }
                    (WatchEventKind::Created, path) if path == kick_path => {
                        tracing::warn!(addr = %self.config.addr, "kick mark seen; exiting");
                        let _ = self.coord.delete_node(&self_path);
                        self.shutdown(&router);
                        break;
                    }
                    (WatchEventKind::Created, SAFEMODE_PATH) => {
                        tracing::warn!("cluster entered safe mode");
                        self.safe_mode.store(true, Ordering::Relaxed);
                    }
                    (WatchEventKind::Deleted, SAFEMODE_PATH) => {
                        tracing::info!("cluster left safe mode");
                        self.safe_mode.store(false, Ordering::Relaxed);
                    }
                    (WatchEventKind::Created | WatchEventKind::Changed, ROOT_TABLET_PATH) => {
                        if let Ok(Some(value)) = self.coord.read_node(ROOT_TABLET_PATH) {
                            let addr = String::from_utf8_lossy(&value).to_string();
                            tracing::info!(root = %addr, "root tablet address updated");
                            *self.root_tablet_addr.lock().unwrap() = addr;
                        }
                    }
                    _ => {}
                }
            }
        });
    }

    /// Stop serving: flush every tablet, leave the router, and drop the
    /// registration node so the master's watch fires.
    pub fn shutdown(&self, router: &RpcRouter) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        router.unregister(&self.config.addr);
        let serving = std::mem::take(&mut *self.serving.lock().unwrap());
        for entry in serving.values() {
            let _ = entry.io.unload();
        }
        drop(serving);
        // Release keyspace file locks so another node can adopt our tablets.
        self.cache.clear();
        let registration = self.registration_path.lock().unwrap().clone();
        if !registration.is_empty() {
            let _ = self.coord.delete_node(&registration);
        }
        tracing::info!(addr = %self.config.addr, "tablet server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    pub fn root_tablet_addr(&self) -> String {
        self.root_tablet_addr.lock().unwrap().clone()
    }

    pub fn serving_count(&self) -> usize {
        self.serving.lock().unwrap().len()
    }

    /// Serving tablet whose range contains `row` for `table`.
    fn find_serving(&self, table: &str, row: &[u8]) -> Option<Arc<ServingTablet>> {
        let serving = self.serving.lock().unwrap();
        let probe = (table.to_string(), row.to_vec());
        let (found, entry) = serving.range(..=probe).next_back()?;
        (found.0 == table && entry.io.range().contains(row)).then(|| entry.clone())
    }

    fn apply_mutation(&self, entry: &ServingTablet, mutation: &RowMutation) -> StatusCode {
        for op in &mutation.ops {
            let result = match op.kind {
                MutationKind::Put => entry.io.write_cell(
                    &mutation.row,
                    &op.family,
                    &op.qualifier,
                    op.timestamp,
                    CellKind::Value,
                    &op.value,
                ),
                MutationKind::DeleteRow => entry.io.write_cell(
                    &mutation.row,
                    "",
                    b"",
                    op.timestamp,
                    CellKind::Del,
                    b"",
                ),
                MutationKind::DeleteColumn => entry.io.write_cell(
                    &mutation.row,
                    &op.family,
                    &op.qualifier,
                    op.timestamp,
                    CellKind::DelColumn,
                    b"",
                ),
            };
            if let Err(err) = result {
                tracing::error!(error = ?err, "mutation apply failed");
                return StatusCode::ServerUnavailable;
            }
            entry
                .counters
                .write_bytes
                .fetch_add((mutation.row.len() + op.value.len()) as u64, Ordering::Relaxed);
        }
        entry.counters.writes.fetch_add(1, Ordering::Relaxed);
        StatusCode::Ok
    }
}

#[async_trait]
impl TabletNodeRpc for TabletNodeImpl {
    async fn load_tablet(&self, request: LoadTabletRequest) -> LoadTabletResponse {
        let sequence_id = request.sequence_id;
        let status = (|| {
            if !self.is_running() {
                return StatusCode::ServerShutdown;
            }
            let meta = &request.tablet;
            let key = (meta.table_name.clone(), meta.key_range.start.clone());
            if self.serving.lock().unwrap().contains_key(&key) {
                // Reloading what we already serve is a no-op ack.
                return StatusCode::Ok;
            }
            let fence = request.rollbacks.last().map(|r| r.rollback_point);
            match TabletIo::load(
                &self.cache,
                &self.config.root_dir,
                &meta.table_name,
                &meta.path,
                meta.key_range.clone(),
                request.schema.clone(),
                request.lineage.clone(),
                fence,
            ) {
                Ok(io) => {
                    tracing::info!(
                        tablet = %meta.path,
                        range = %meta.key_range,
                        lineage = ?request.lineage,
                        "tablet loaded"
                    );
                    self.serving.lock().unwrap().insert(
                        key,
                        Arc::new(ServingTablet {
                            io: Arc::new(io),
                            schema: Mutex::new(request.schema.clone()),
                            counters: OpCounters::default(),
                        }),
                    );
                    StatusCode::Ok
                }
                Err(err) => {
                    tracing::error!(tablet = %meta.path, error = ?err, "tablet load failed");
                    StatusCode::ServerUnavailable
                }
            }
        })();
        LoadTabletResponse {
            sequence_id,
            status,
        }
    }

    async fn unload_tablet(&self, request: UnloadTabletRequest) -> UnloadTabletResponse {
        let key = (request.table_name.clone(), request.key_start.clone());
        let entry = self.serving.lock().unwrap().remove(&key);
        let status = match entry {
            Some(entry) => {
                if let Err(err) = entry.io.unload() {
                    tracing::error!(error = ?err, "tablet unload flush failed");
                }
                // Keep ancestor handles shared; only drop our own directory.
                self.cache
                    .evict(&self.config.root_dir.join(entry.io.path()));
                tracing::info!(tablet = %entry.io.path(), "tablet unloaded");
                StatusCode::Ok
            }
            None => StatusCode::KeyNotInRange,
        };
        UnloadTabletResponse {
            sequence_id: request.sequence_id,
            status,
        }
    }

    async fn split_tablet(&self, request: SplitTabletRequest) -> SplitTabletResponse {
        let key = (request.table_name.clone(), request.key_start.clone());
        let entry = self.serving.lock().unwrap().get(&key).cloned();
        let (status, split_key) = match entry {
            Some(entry) => match entry.io.split_key() {
                Ok(key) => (StatusCode::Ok, key),
                Err(err) => {
                    tracing::info!(error = ?err, "split key unavailable");
                    (StatusCode::BadParam, Vec::new())
                }
            },
            None => (StatusCode::KeyNotInRange, Vec::new()),
        };
        SplitTabletResponse {
            sequence_id: request.sequence_id,
            status,
            split_key,
        }
    }

    async fn compact_tablet(&self, request: CompactTabletRequest) -> CompactTabletResponse {
        let key = (request.table_name.clone(), request.key_start.clone());
        let entry = self.serving.lock().unwrap().get(&key).cloned();
        let (status, data_size) = match entry {
            Some(entry) => match entry.io.compact() {
                Ok(()) => (StatusCode::Ok, entry.io.data_size().0),
                Err(err) => {
                    tracing::error!(error = ?err, "compaction failed");
                    (StatusCode::ServerUnavailable, 0)
                }
            },
            None => (StatusCode::KeyNotInRange, 0),
        };
        CompactTabletResponse {
            sequence_id: request.sequence_id,
            status,
            data_size,
        }
    }

    async fn write_tablet(&self, request: WriteTabletRequest) -> WriteTabletResponse {
        let mut row_status = Vec::with_capacity(request.rows.len());
        let mut any_ok = false;
        for mutation in &request.rows {
            match self.find_serving(&request.table_name, &mutation.row) {
                Some(entry) => {
                    let status = self.apply_mutation(&entry, mutation);
                    any_ok |= status == StatusCode::Ok;
                    row_status.push(status);
                }
                None => row_status.push(StatusCode::KeyNotInRange),
            }
        }
        let status = if any_ok || request.rows.is_empty() {
            StatusCode::Ok
        } else {
            StatusCode::KeyNotInRange
        };
        WriteTabletResponse {
            sequence_id: request.sequence_id,
            status,
            row_status,
        }
    }

    async fn read_tablet(&self, request: ReadTabletRequest) -> ReadTabletResponse {
        let mut rows = Vec::with_capacity(request.rows.len());
        let mut any_in_range = false;
        for row in &request.rows {
            match self.find_serving(&request.table_name, row) {
                Some(entry) => {
                    any_in_range = true;
                    entry.counters.reads.fetch_add(1, Ordering::Relaxed);
                    match entry.io.read(row) {
                        Ok(Some(value)) => {
                            entry
                                .counters
                                .read_bytes
                                .fetch_add(value.len() as u64, Ordering::Relaxed);
                            rows.push(RowReadResult {
                                status: StatusCode::Ok,
                                value,
                            });
                        }
                        Ok(None) => rows.push(RowReadResult {
                            status: StatusCode::NotFound,
                            value: Vec::new(),
                        }),
                        Err(err) => {
                            tracing::error!(error = ?err, "read failed");
                            rows.push(RowReadResult {
                                status: StatusCode::ServerUnavailable,
                                value: Vec::new(),
                            });
                        }
                    }
                }
                None => rows.push(RowReadResult {
                    status: StatusCode::KeyNotInRange,
                    value: Vec::new(),
                }),
            }
        }
        let status = if any_in_range || request.rows.is_empty() {
            StatusCode::Ok
        } else {
            StatusCode::KeyNotInRange
        };
        ReadTabletResponse {
            sequence_id: request.sequence_id,
            status,
            rows,
        }
    }

    async fn scan_tablet(&self, request: ScanTabletRequest) -> ScanTabletResponse {
        let Some(entry) = self.find_serving(&request.table_name, &request.start) else {
            return ScanTabletResponse {
                sequence_id: request.sequence_id,
                status: StatusCode::KeyNotInRange,
                complete: true,
                entries: Vec::new(),
            };
        };
        entry.counters.scans.fetch_add(1, Ordering::Relaxed);
        let page = if request.max_entries == 0 {
            self.config.scan_page
        } else {
            request.max_entries.min(self.config.scan_page)
        };
        match entry
            .io
            .scan_rows(&request.start, &request.end, page, request.round_down)
        {
            Ok((rows, in_tablet_complete)) => {
                let tablet_end = entry.io.range().end.clone();
                // The requested interval may continue past this tablet.
                let complete = in_tablet_complete
                    && (tablet_end.is_empty()
                        || (!request.end.is_empty() && tablet_end >= request.end));
                let mut bytes = 0u64;
                let entries = rows
                    .into_iter()
                    .map(|(key, value)| {
                        bytes += (key.len() + value.len()) as u64;
                        KeyValue { key, value }
                    })
                    .collect();
                entry.counters.scan_bytes.fetch_add(bytes, Ordering::Relaxed);
                ScanTabletResponse {
                    sequence_id: request.sequence_id,
                    status: StatusCode::Ok,
                    complete,
                    entries,
                }
            }
            Err(err) => {
                tracing::error!(error = ?err, "scan failed");
                ScanTabletResponse {
                    sequence_id: request.sequence_id,
                    status: StatusCode::ServerUnavailable,
                    complete: true,
                    entries: Vec::new(),
                }
            }
        }
    }

    async fn query(&self, request: QueryRequest) -> QueryResponse {
        let serving: Vec<((String, Vec<u8>), Arc<ServingTablet>)> = self
            .serving
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut tablets = Vec::with_capacity(serving.len());
        let mut inherited: BTreeMap<String, Vec<InheritedAncestor>> = BTreeMap::new();
        let mut total_size = 0u64;
        let mut total_load = 0u64;
        for ((table_name, start), entry) in serving {
            let (data_size, lg_size) = entry.io.data_size();
            total_size += data_size;
            let counter = entry.counters.take();
            total_load += counter.load_weight();
            tablets.push(TabletReport {
                meta: TabletMeta {
                    table_name: table_name.clone(),
                    path: entry.io.path().to_string(),
                    key_range: KeyRange::new(start, entry.io.range().end.clone()),
                    server_addr: self.config.addr.clone(),
                    status: TabletStatus::Ready,
                    data_size,
                    lg_size,
                    parents: entry.io.lineage(),
                    ..Default::default()
                },
                counter,
            });
            if request.is_gc {
                let section = inherited.entry(table_name).or_default();
                for (ancestor, files) in entry.io.inherited_live_files() {
                    section.push(InheritedAncestor { ancestor, files });
                }
            }
        }

        QueryResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::Ok,
            tablets,
            inherited: inherited
                .into_iter()
                .map(|(table_name, ancestors)| InheritedLiveFiles {
                    table_name,
                    ancestors,
                })
                .collect(),
            stat: NodeStat {
                tablet_count: self.serving_count() as u64,
                data_size: total_size,
                load_weight: total_load,
            },
        }
    }

    async fn update_schema(&self, request: UpdateSchemaRequest) -> UpdateSchemaResponse {
        let mut acked_ranges = Vec::new();
        let serving = self.serving.lock().unwrap();
        for ((table_name, _), entry) in serving.iter() {
            if table_name == &request.table_name {
                *entry.schema.lock().unwrap() = request.schema.clone();
                acked_ranges.push(entry.io.range().clone());
            }
        }
        tracing::info!(
            table = %request.table_name,
            ranges = acked_ranges.len(),
            "schema update applied"
        );
        UpdateSchemaResponse {
            sequence_id: request.sequence_id,
            status: StatusCode::Ok,
            acked_ranges,
        }
    }

    async fn snapshot_tablet(&self, request: SnapshotTabletRequest) -> SnapshotTabletResponse {
        let key = (request.table_name.clone(), request.key_start.clone());
        let entry = self.serving.lock().unwrap().get(&key).cloned();
        let (status, snapshot_point) = match entry {
            Some(entry) => (StatusCode::Ok, entry.io.snapshot_point()),
            None => (StatusCode::KeyNotInRange, 0),
        };
        SnapshotTabletResponse {
            sequence_id: request.sequence_id,
            status,
            snapshot_point,
        }
    }

    async fn rollback_tablet(&self, request: RollbackTabletRequest) -> RollbackTabletResponse {
        let key = (request.table_name.clone(), request.key_start.clone());
        let entry = self.serving.lock().unwrap().get(&key).cloned();
        let (status, rollback_point) = match entry {
            Some(entry) => {
                entry.io.set_read_fence(request.snapshot_id);
                (StatusCode::Ok, request.snapshot_id)
            }
            None => (StatusCode::KeyNotInRange, 0),
        };
        RollbackTabletResponse {
            sequence_id: request.sequence_id,
            status,
            rollback_point,
        }
    }
}
