//! Client request pipeline: batched mutations and reads with routing via the
//! meta cache, retry tiers, flow control, and per-task deadlines.
//!
//! Each user operation becomes a pooled task with a monotonic id. Tasks
//! resolve to a server through the meta cache (parking there on a miss),
//! group into per-server batches, and commit when the batch fills, its timer
//! fires, or a synchronous caller is packed. Retryable failures regroup by
//! retry tier and redispatch together after `base * factor^tier`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::coordination::Coordination;
use crate::meta_cache::{MetaCache, MetaCacheConfig, MetaWake};
use crate::meta_codec::{self, MetaKey};
use crate::rpc::{
    MutationOp, ReadTabletRequest, RowMutation, RpcRouter, ScanTabletRequest, SequenceId,
    WriteTabletRequest, META_TABLE_NAME,
};
use crate::status::StatusCode;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub meta: MetaCacheConfig,
    /// Batch commit trigger: packed row count.
    pub commit_size: usize,
    /// Batch commit trigger: encoded size in bytes.
    pub max_rpc_size: usize,
    /// Batch commit trigger: oldest packed task age.
    pub write_commit_timeout: Duration,
    pub retry_base: Duration,
    pub retry_factor: u32,
    pub max_retry: u32,
    /// Flow control: cap on in-flight tasks per table handle.
    pub pending_limit: usize,
    pub task_timeout: Duration,
    pub cookie_dir: Option<PathBuf>,
    pub cookie_update_interval: Duration,
    pub cluster_id: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            meta: MetaCacheConfig::default(),
            commit_size: 64,
            max_rpc_size: 1 << 20,
            write_commit_timeout: Duration::from_millis(20),
            retry_base: Duration::from_millis(50),
            retry_factor: 2,
            max_retry: 6,
            pending_limit: 10_000,
            task_timeout: Duration::from_secs(30),
            cookie_dir: None,
            cookie_update_interval: Duration::from_secs(60),
            cluster_id: "default".to_string(),
        }
    }
}

/// Entry point: opens per-table handles over one coordination session.
pub struct Client {
    coord: Arc<dyn Coordination>,
    router: RpcRouter,
    config: ClientConfig,
    sequence: Arc<SequenceId>,
}

impl Client {
    pub fn new(coord: Arc<dyn Coordination>, router: RpcRouter, config: ClientConfig) -> Self {
        Self {
            coord,
            router,
            config,
            sequence: Arc::new(SequenceId::new()),
        }
    }

    /// Open a handle to `table`, restoring its cookie when configured.
    pub async fn open_table(&self, table: &str) -> Arc<TableClient> {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let meta_cache = MetaCache::new(
            table,
            self.config.meta.clone(),
            self.coord.clone(),
            self.router.clone(),
            wake_tx,
        );
        let handle = Arc::new(TableClient {
            table_name: table.to_string(),
            config: self.config.clone(),
            router: self.router.clone(),
            sequence: self.sequence.clone(),
            meta_cache,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            pending_count: Arc::new(AtomicUsize::new(0)),
            batches: Mutex::new(HashMap::new()),
            retry_buckets: Mutex::new(HashMap::new()),
            cookie_path: Mutex::new(None),
        });
        handle.clone().spawn_wake_handler(wake_rx);
        handle.clone().spawn_timeout_sweeper();

        if let Some(dir) = &self.config.cookie_dir {
            let create_time = self.read_table_create_time(table).await.unwrap_or(0);
            let path =
                crate::cookie::cookie_path(dir, table, create_time, &self.config.cluster_id);
            for meta in crate::cookie::restore_cookie(&path, table) {
                // Restored entries carry timestamp zero so the first routing
                // fault immediately re-fetches them.
                handle.meta_cache.install(meta, 0);
            }
            *handle.cookie_path.lock().unwrap() = Some(path);
            handle.clone().spawn_cookie_dumper();
        }
        handle
    }

    /// Table record create time, for the cookie file name.
    async fn read_table_create_time(&self, table: &str) -> Option<u64> {
        let root = self.coord.read_node(crate::coordination::ROOT_TABLET_PATH).ok()??;
        let addr = String::from_utf8_lossy(&root).to_string();
        let node = self.router.node(&addr)?;
        let key = meta_codec::encode_table_key(table);
        let mut end = key.clone();
        end.push(0x00);
        let response = node
            .scan_tablet(ScanTabletRequest {
                sequence_id: self.sequence.next(),
                table_name: META_TABLE_NAME.to_string(),
                start: key,
                end,
                max_entries: 1,
                round_down: false,
            })
            .await;
        let entry = response.entries.first()?;
        match meta_codec::decode_meta_key(&entry.key).ok()? {
            MetaKey::Table(_) => Some(meta_codec::decode_table_value(&entry.value).ok()?.create_time_ms),
            _ => None,
        }
    }
}

enum TaskKind {
    Mutate(Vec<MutationOp>),
    Read,
    /// Routing-only task used by scans; completes with the resolved address.
    Resolve,
}

struct SdkTask {
    row: Vec<u8>,
    kind: TaskKind,
    retries: u32,
    meta_ts: u64,
    last_error: Option<StatusCode>,
    deadline_ms: u64,
    flush: bool,
    done: Option<oneshot::Sender<Result<Option<Vec<u8>>, StatusCode>>>,
}

#[derive(Default)]
struct Batch {
    ids: Vec<u64>,
    bytes: usize,
    /// Bumped on every commit so a stale timer cannot re-commit.
    generation: u64,
}

pub struct TableClient {
    table_name: String,
    config: ClientConfig,
    router: RpcRouter,
    sequence: Arc<SequenceId>,
    meta_cache: Arc<MetaCache>,
    tasks: Mutex<HashMap<u64, SdkTask>>,
    next_id: AtomicU64,
    pending_count: Arc<AtomicUsize>,
    /// (server addr, is_read) -> open batch.
    batches: Mutex<HashMap<(String, bool), Batch>>,
    retry_buckets: Mutex<HashMap<u32, Vec<u64>>>,
    cookie_path: Mutex<Option<PathBuf>>,
}

impl TableClient {
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    // ---- public data-plane API --------------------------------------------

    /// Synchronous put: commits its batch immediately.
    pub async fn put(self: &Arc<Self>, row: &[u8], value: &[u8]) -> Result<(), StatusCode> {
        self.apply_mutation(row, vec![MutationOp::put(value.to_vec())], true)
            .await
            .map(|_| ())
    }

    /// Batched put: waits for the surrounding batch to commit.
    pub async fn put_async(self: &Arc<Self>, row: &[u8], value: &[u8]) -> Result<(), StatusCode> {
        self.apply_mutation(row, vec![MutationOp::put(value.to_vec())], false)
            .await
            .map(|_| ())
    }

    /// Fail-fast put for async callers under flow-control pressure.
    pub async fn try_put(self: &Arc<Self>, row: &[u8], value: &[u8]) -> Result<(), StatusCode> {
        if self.pending_count.load(Ordering::Relaxed) >= self.config.pending_limit {
            return Err(StatusCode::Busy);
        }
        self.put(row, value).await
    }

    pub async fn delete(self: &Arc<Self>, row: &[u8]) -> Result<(), StatusCode> {
        self.apply_mutation(row, vec![MutationOp::delete_row()], true)
            .await
            .map(|_| ())
    }

    pub async fn get(self: &Arc<Self>, row: &[u8]) -> Result<Option<Vec<u8>>, StatusCode> {
        self.submit_task(row.to_vec(), TaskKind::Read, true).await
    }

    /// Commit every open batch now.
    pub fn flush(self: &Arc<Self>) {
        let keys: Vec<(String, bool)> = self.batches.lock().unwrap().keys().cloned().collect();
        for (addr, is_read) in keys {
            self.commit_batch(&addr, is_read);
        }
    }

    /// Row scan over [start, end), following tablet boundaries and healing
    /// stale routes as it goes.
    pub async fn scan(
        self: &Arc<Self>,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StatusCode> {
        let mut out = Vec::new();
        let mut cursor = start.to_vec();
        let mut last_error: Option<StatusCode> = None;
        let mut meta_ts = 0u64;
        let mut attempts = 0u32;
        loop {
            let addr = match self
                .resolve_addr(&cursor, last_error.take(), meta_ts)
                .await?
            {
                Some(addr) => addr,
                None => return Err(StatusCode::ConnectError),
            };
            let Some(node) = self.router.node(&addr) else {
                last_error = Some(StatusCode::ConnectError);
                attempts += 1;
                if attempts > self.config.max_retry {
                    return Err(StatusCode::ConnectError);
                }
                continue;
            };
            let response = node
                .scan_tablet(ScanTabletRequest {
                    sequence_id: self.sequence.next(),
                    table_name: self.table_name.clone(),
                    start: cursor.clone(),
                    end: end.to_vec(),
                    max_entries: 0,
                    round_down: false,
                })
                .await;
            match response.status {
                StatusCode::Ok => {
                    attempts = 0;
                    let complete = response.complete;
                    let got_rows = !response.entries.is_empty();
                    for entry in response.entries {
                        out.push((entry.key, entry.value));
                    }
                    if complete {
                        return Ok(out);
                    }
                    if got_rows {
                        let mut next = out.last().map(|(k, _)| k.clone()).unwrap_or_default();
                        next.push(0x00);
                        cursor = next;
                    } else if let Some(tablet_end) = self
                        .meta_cache
                        .cached_range_end(&cursor)
                        .filter(|end| !end.is_empty())
                    {
                        // Empty tablet mid-range: jump to its end key.
                        cursor = tablet_end;
                    } else {
                        // Range boundary unknown: force a meta re-fetch.
                        last_error = Some(StatusCode::KeyNotInRange);
                        meta_ts = u64::MAX;
                        attempts += 1;
                        if attempts > self.config.max_retry {
                            return Err(StatusCode::KeyNotInRange);
                        }
                    }
                }
                status if status.is_retryable() => {
                    last_error = Some(status);
                    meta_ts = u64::MAX;
                    attempts += 1;
                    if attempts > self.config.max_retry {
                        return Err(status);
                    }
                    tokio::time::sleep(self.config.retry_base * attempts).await;
                }
                status => return Err(status),
            }
        }
    }

    /// Apply a full row mutation (several ops, one row, applied in order).
    pub async fn apply_mutation(
        self: &Arc<Self>,
        row: &[u8],
        ops: Vec<MutationOp>,
        flush: bool,
    ) -> Result<Option<Vec<u8>>, StatusCode> {
        self.submit_task(row.to_vec(), TaskKind::Mutate(ops), flush)
            .await
    }

    // ---- task machinery ----------------------------------------------------

    async fn submit_task(
        self: &Arc<Self>,
        row: Vec<u8>,
        kind: TaskKind,
        flush: bool,
    ) -> Result<Option<Vec<u8>>, StatusCode> {
        // Flow control: sync callers block until the pool drains.
        while self.pending_count.load(Ordering::Relaxed) >= self.config.pending_limit {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (done_tx, done_rx) = oneshot::channel();
        let task = SdkTask {
            row,
            kind,
            retries: 0,
            meta_ts: 0,
            last_error: None,
            deadline_ms: crate::unix_time_ms() + self.config.task_timeout.as_millis() as u64,
            flush,
            done: Some(done_tx),
        };
        self.pending_count.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().unwrap().insert(id, task);
        self.dispatch_task(id);
        match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(StatusCode::Timeout),
        }
    }

    fn complete_task(&self, id: u64, result: Result<Option<Vec<u8>>, StatusCode>) {
        let task = self.tasks.lock().unwrap().remove(&id);
        if let Some(mut task) = task {
            self.pending_count.fetch_sub(1, Ordering::Relaxed);
            if let Some(done) = task.done.take() {
                let _ = done.send(result);
            }
        }
    }

    /// Route a task through the meta cache; parks on miss.
    fn dispatch_task(self: &Arc<Self>, id: u64) {
        let (row, last_error, meta_ts, is_resolve) = {
            let tasks = self.tasks.lock().unwrap();
            let Some(task) = tasks.get(&id) else {
                return;
            };
            (
                task.row.clone(),
                task.last_error,
                task.meta_ts,
                matches!(task.kind, TaskKind::Resolve),
            )
        };
        match self
            .meta_cache
            .resolve_or_enqueue(&row, id, last_error, meta_ts)
        {
            Some((addr, meta_ts)) => {
                if let Some(task) = self.tasks.lock().unwrap().get_mut(&id) {
                    task.meta_ts = meta_ts;
                    task.last_error = None;
                }
                if is_resolve {
                    self.complete_task(id, Ok(Some(addr.into_bytes())));
                } else {
                    self.add_to_batch(&addr, id);
                }
            }
            None => {
                // Parked; the meta cache wakes us via the wake channel.
            }
        }
    }

    async fn resolve_addr(
        self: &Arc<Self>,
        row: &[u8],
        last_error: Option<StatusCode>,
        meta_ts: u64,
    ) -> Result<Option<String>, StatusCode> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (done_tx, done_rx) = oneshot::channel();
        self.pending_count.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().unwrap().insert(
            id,
            SdkTask {
                row: row.to_vec(),
                kind: TaskKind::Resolve,
                retries: 0,
                meta_ts,
                last_error,
                deadline_ms: crate::unix_time_ms() + self.config.task_timeout.as_millis() as u64,
                flush: true,
                done: Some(done_tx),
            },
        );
        self.dispatch_task(id);
        match done_rx.await {
            Ok(Ok(Some(addr))) => Ok(Some(String::from_utf8_lossy(&addr).to_string())),
            Ok(Ok(None)) => Ok(None),
            Ok(Err(status)) => Err(status),
            Err(_) => Err(StatusCode::Timeout),
        }
    }

    /// Pack a routed task into its per-server batch and fire the commit
    /// triggers: size, count, flush, or the per-batch timer.
    fn add_to_batch(self: &Arc<Self>, addr: &str, id: u64) {
        let (bytes, flush, is_read) = {
            let tasks = self.tasks.lock().unwrap();
            let Some(task) = tasks.get(&id) else {
                return;
            };
            let bytes = task.row.len()
                + match &task.kind {
                    TaskKind::Mutate(ops) => {
                        ops.iter().map(|op| op.value.len() + 16).sum::<usize>()
                    }
                    _ => 16,
                };
            (bytes, task.flush, matches!(task.kind, TaskKind::Read))
        };

        let key = (addr.to_string(), is_read);
        let should_commit;
        let start_timer;
        {
            let mut batches = self.batches.lock().unwrap();
            let batch = batches.entry(key.clone()).or_default();
            start_timer = batch.ids.is_empty();
            batch.ids.push(id);
            batch.bytes += bytes;
            should_commit = flush
                || batch.ids.len() >= self.config.commit_size
                || batch.bytes >= self.config.max_rpc_size;
        }
        if should_commit {
            self.commit_batch(addr, is_read);
        } else if start_timer {
            let client = self.clone();
            let addr = addr.to_string();
            let generation = self
                .batches
                .lock()
                .unwrap()
                .get(&key)
                .map(|b| b.generation)
                .unwrap_or(0);
            tokio::spawn(async move {
                tokio::time::sleep(client.config.write_commit_timeout).await;
                let still_open = client
                    .batches
                    .lock()
                    .unwrap()
                    .get(&(addr.clone(), is_read))
                    .is_some_and(|b| b.generation == generation && !b.ids.is_empty());
                if still_open {
                    client.commit_batch(&addr, is_read);
                }
            });
        }
    }

    fn commit_batch(self: &Arc<Self>, addr: &str, is_read: bool) {
        let ids = {
            let mut batches = self.batches.lock().unwrap();
            let Some(batch) = batches.get_mut(&(addr.to_string(), is_read)) else {
                return;
            };
            batch.generation += 1;
            batch.bytes = 0;
            std::mem::take(&mut batch.ids)
        };
        if ids.is_empty() {
            return;
        }
        let client = self.clone();
        let addr = addr.to_string();
        tokio::spawn(async move {
            if is_read {
                client.commit_reads(&addr, ids).await;
            } else {
                client.commit_mutations(&addr, ids).await;
            }
        });
    }

    async fn commit_mutations(self: &Arc<Self>, addr: &str, ids: Vec<u64>) {
        let mut rows = Vec::with_capacity(ids.len());
        let mut live_ids = Vec::with_capacity(ids.len());
        {
            let tasks = self.tasks.lock().unwrap();
            for id in ids {
                let Some(task) = tasks.get(&id) else {
                    continue; // timed out while packed
                };
                if let TaskKind::Mutate(ops) = &task.kind {
                    rows.push(RowMutation {
                        row: task.row.clone(),
                        ops: ops.clone(),
                    });
                    live_ids.push(id);
                }
            }
        }
        if live_ids.is_empty() {
            return;
        }

        let Some(node) = self.router.node(addr) else {
            for id in live_ids {
                self.schedule_retry(id, StatusCode::ConnectError);
            }
            return;
        };
        let response = node
            .write_tablet(WriteTabletRequest {
                sequence_id: self.sequence.next(),
                table_name: self.table_name.clone(),
                rows,
            })
            .await;

        for (idx, id) in live_ids.into_iter().enumerate() {
            let status = response
                .row_status
                .get(idx)
                .copied()
                .unwrap_or(response.status);
            match status {
                StatusCode::Ok => self.complete_task(id, Ok(None)),
                status if status.is_retryable() => self.schedule_retry(id, status),
                status => self.complete_task(id, Err(status)),
            }
        }
    }

    async fn commit_reads(self: &Arc<Self>, addr: &str, ids: Vec<u64>) {
        let mut rows = Vec::with_capacity(ids.len());
        let mut live_ids = Vec::with_capacity(ids.len());
        {
            let tasks = self.tasks.lock().unwrap();
            for id in ids {
                let Some(task) = tasks.get(&id) else {
                    continue;
                };
                if matches!(task.kind, TaskKind::Read) {
                    rows.push(task.row.clone());
                    live_ids.push(id);
                }
            }
        }
        if live_ids.is_empty() {
            return;
        }

        let Some(node) = self.router.node(addr) else {
            for id in live_ids {
                self.schedule_retry(id, StatusCode::ConnectError);
            }
            return;
        };
        let response = node
            .read_tablet(ReadTabletRequest {
                sequence_id: self.sequence.next(),
                table_name: self.table_name.clone(),
                rows,
            })
            .await;

        for (idx, id) in live_ids.into_iter().enumerate() {
            let row_result = response.rows.get(idx);
            let status = row_result
                .map(|r| r.status)
                .unwrap_or(response.status);
            match status {
                StatusCode::Ok => self.complete_task(
                    id,
                    Ok(Some(row_result.map(|r| r.value.clone()).unwrap_or_default())),
                ),
                StatusCode::NotFound => self.complete_task(id, Ok(None)),
                status if status.is_retryable() => self.schedule_retry(id, status),
                status => self.complete_task(id, Err(status)),
            }
        }
    }

    /// Group retries by tier: the first task entering a tier arms one timer;
    /// everything in the tier redispatches together when it fires.
    fn schedule_retry(self: &Arc<Self>, id: u64, status: StatusCode) {
        let tier = {
            let mut tasks = self.tasks.lock().unwrap();
            let Some(task) = tasks.get_mut(&id) else {
                return;
            };
            task.retries += 1;
            task.last_error = Some(status);
            if task.retries > self.config.max_retry {
                drop(tasks);
                tracing::warn!(id, %status, "task out of retries");
                self.complete_task(id, Err(status));
                return;
            }
            task.retries
        };

        let arm_timer = {
            let mut buckets = self.retry_buckets.lock().unwrap();
            let bucket = buckets.entry(tier).or_default();
            bucket.push(id);
            bucket.len() == 1
        };
        if arm_timer {
            let client = self.clone();
            let delay = self.config.retry_base * self.config.retry_factor.pow(tier);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let ids = client
                    .retry_buckets
                    .lock()
                    .unwrap()
                    .remove(&tier)
                    .unwrap_or_default();
                for id in ids {
                    client.dispatch_task(id);
                }
            });
        }
    }

    fn spawn_wake_handler(self: Arc<Self>, mut wake_rx: mpsc::UnboundedReceiver<MetaWake>) {
        tokio::spawn(async move {
            while let Some(wake) = wake_rx.recv().await {
                match wake {
                    MetaWake::Ready { task_ids, .. } => {
                        for id in task_ids {
                            self.dispatch_task(id);
                        }
                    }
                    MetaWake::Failed { task_ids, status } => {
                        for id in task_ids {
                            self.schedule_retry(id, status);
                        }
                    }
                }
            }
        });
    }

    /// Expire tasks past their deadline with Timeout.
    fn spawn_timeout_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                ticker.tick().await;
                let now = crate::unix_time_ms();
                let expired: Vec<(u64, Option<StatusCode>, u32)> = self
                    .tasks
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(_, task)| task.deadline_ms <= now)
                    .map(|(&id, task)| (id, task.last_error, task.retries))
                    .collect();
                for (id, last_error, retries) in expired {
                    tracing::warn!(id, ?last_error, retries, "task deadline expired");
                    self.complete_task(id, Err(StatusCode::Timeout));
                }
            }
        });
    }

    fn spawn_cookie_dumper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.cookie_update_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.dump_cookie();
            }
        });
    }

    /// Write the current resolved cache to the cookie file.
    pub fn dump_cookie(&self) {
        let Some(path) = self.cookie_path.lock().unwrap().clone() else {
            return;
        };
        let entries = self.meta_cache.normal_entries();
        if let Err(err) = crate::cookie::dump_cookie(&path, &self.table_name, entries) {
            tracing::warn!(error = ?err, "cookie dump failed");
        }
    }
}
