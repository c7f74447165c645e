//! Client-side meta-routing cache: resolves a user row key to the tablet
//! server currently holding it.
//!
//! Resolution is three-level: the coordination service names the root (meta)
//! tablet's server, a meta scan against it yields tablet records, and the
//! records are cached as an ordered map keyed by range start. Lookup is
//! predecessor-by-start plus an end-bound check.
//!
//! Concurrent misses and stale-cache faults for keys in one contiguous
//! region coalesce into a single meta scan; each waiting task parks in a
//! per-row pending list and is woken when a covering Normal node lands.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::coordination::{Coordination, ROOT_TABLET_PATH};
use crate::meta::TabletMeta;
use crate::meta_codec::{self, MetaKey};
use crate::rpc::{RpcRouter, ScanTabletRequest, SequenceId, META_TABLE_NAME};
use crate::status::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Normal,
    WaitUpdate,
    Updating,
    DelayUpdate,
}

#[derive(Debug, Clone)]
pub struct TabletMetaNode {
    pub meta: TabletMeta,
    pub status: NodeStatus,
    pub update_time_ms: u64,
}

/// Wake events delivered back to the request pipeline.
#[derive(Debug)]
pub enum MetaWake {
    /// The listed tasks now route to `addr` with this meta timestamp.
    Ready {
        task_ids: Vec<u64>,
        addr: String,
        meta_ts: u64,
    },
    /// Meta resolution failed permanently for these tasks.
    Failed { task_ids: Vec<u64>, status: StatusCode },
}

#[derive(Debug, Clone)]
pub struct MetaCacheConfig {
    /// Minimum interval between re-fetches of the same node.
    pub update_interval: Duration,
    /// Cap on concurrently running meta scans.
    pub max_concurrency: u32,
    /// Bounded retries for an empty root address or a failed meta scan.
    pub scan_retry: u32,
    pub scan_page: usize,
}

impl Default for MetaCacheConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_millis(200),
            max_concurrency: 3,
            scan_retry: 5,
            scan_page: 512,
        }
    }
}

struct CacheInner {
    nodes: BTreeMap<Vec<u8>, TabletMetaNode>,
    /// row -> ids of tasks waiting for a Normal node covering that row.
    pending: BTreeMap<Vec<u8>, Vec<u64>>,
    updating_count: u32,
}

pub struct MetaCache {
    table_name: String,
    config: MetaCacheConfig,
    coord: Arc<dyn Coordination>,
    router: RpcRouter,
    sequence: Arc<SequenceId>,
    wake_tx: mpsc::UnboundedSender<MetaWake>,
    inner: Mutex<CacheInner>,
}

impl MetaCache {
    pub fn new(
        table_name: &str,
        config: MetaCacheConfig,
        coord: Arc<dyn Coordination>,
        router: RpcRouter,
        wake_tx: mpsc::UnboundedSender<MetaWake>,
    ) -> Arc<Self> {
        Arc::new(Self {
            table_name: table_name.to_string(),
            config,
            coord,
            router,
            sequence: Arc::new(SequenceId::new()),
            wake_tx,
            inner: Mutex::new(CacheInner {
                nodes: BTreeMap::new(),
                pending: BTreeMap::new(),
                updating_count: 0,
            }),
        })
    }

    /// Resolve `row` or park the task until the cache can serve it.
    ///
    /// `last_error`/`task_meta_ts` implement stale detection: a routing error
    /// whose timestamp is not older than the current node triggers a
    /// (rate-limited) re-fetch instead of handing back the same stale entry.
    pub fn resolve_or_enqueue(
        self: &Arc<Self>,
        row: &[u8],
        task_id: u64,
        last_error: Option<StatusCode>,
        task_meta_ts: u64,
    ) -> Option<(String, u64)> {
        let mut inner = self.inner.lock().unwrap();
        let found = lookup(&inner.nodes, row).map(|(key, node)| {
            (
                key.clone(),
                node.status,
                node.update_time_ms,
                node.meta.server_addr.clone(),
                node.meta.key_range.clone(),
            )
        });
        let Some((node_start, status, update_time_ms, server_addr, node_range)) = found else {
            tracing::debug!(row = %String::from_utf8_lossy(row), "meta miss");
            inner.pending.entry(row.to_vec()).or_default().push(task_id);
            // Placeholder covering just this row, queued for update.
            let mut placeholder_end = row.to_vec();
            placeholder_end.push(0x00);
            let mut meta = TabletMeta::default();
            meta.table_name = self.table_name.clone();
            meta.key_range = crate::meta::KeyRange::new(row.to_vec(), placeholder_end);
            inner.nodes.insert(
                row.to_vec(),
                TabletMetaNode {
                    meta,
                    status: NodeStatus::WaitUpdate,
                    update_time_ms: 0,
                },
            );
            self.update_meta_async(&mut inner);
            return None;
        };

        if status != NodeStatus::Normal {
            inner.pending.entry(row.to_vec()).or_default().push(task_id);
            return None;
        }

        let stale_fault = last_error.is_some_and(|code| code.is_routing_stale());
        if stale_fault && task_meta_ts >= update_time_ms {
            inner.pending.entry(row.to_vec()).or_default().push(task_id);
            let now = crate::unix_time_ms();
            let not_before = update_time_ms + self.config.update_interval.as_millis() as u64;
            if not_before <= now {
                if let Some(node) = inner.nodes.get_mut(&node_start) {
                    node.status = NodeStatus::WaitUpdate;
                }
                self.update_meta_async(&mut inner);
            } else {
                if let Some(node) = inner.nodes.get_mut(&node_start) {
                    node.status = NodeStatus::DelayUpdate;
                }
                let cache = self.clone();
                let delay = Duration::from_millis(not_before - now);
                let (start, end) = (node_range.start, node_range.end);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    cache.delay_update_meta(start, end);
                });
            }
            return None;
        }

        Some((server_addr, update_time_ms))
    }

    /// End key of the cached node covering `row`, if any.
    pub fn cached_range_end(&self, row: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        lookup(&inner.nodes, row)
            .filter(|(_, node)| node.status == NodeStatus::Normal)
            .map(|(_, node)| node.meta.key_range.end.clone())
    }

    /// Flip delayed nodes in [start, end] back to WaitUpdate and kick a scan.
    fn delay_update_meta(self: &Arc<Self>, start: Vec<u8>, end: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<Vec<u8>> = inner
            .nodes
            .range(start..)
            .take_while(|(_, node)| {
                let node_end = &node.meta.key_range.end;
                end.is_empty() || node_end.is_empty() || node_end.as_slice() <= end.as_slice()
            })
            .filter(|(_, node)| node.status == NodeStatus::DelayUpdate)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(node) = inner.nodes.get_mut(&key) {
                node.status = NodeStatus::WaitUpdate;
            }
        }
        self.update_meta_async(&mut inner);
    }

    /// Launch one scan over the first contiguous run of WaitUpdate nodes,
    /// respecting the concurrency cap.
    fn update_meta_async(self: &Arc<Self>, inner: &mut CacheInner) {
        if inner.updating_count >= self.config.max_concurrency {
            return;
        }
        let mut scan_start: Option<Vec<u8>> = None;
        let mut scan_end: Vec<u8> = Vec::new();
        let mut expand_end: Vec<u8> = Vec::new();
        let mut run_keys: Vec<Vec<u8>> = Vec::new();
        for (key, node) in inner.nodes.iter() {
            let waiting = node.status == NodeStatus::WaitUpdate;
            match (&scan_start, waiting) {
                (None, false) => continue,
                (None, true) => {
                    scan_start = Some(node.meta.key_range.start.clone());
                    scan_end = node.meta.key_range.end.clone();
                    run_keys.push(key.clone());
                }
                (Some(_), true) => {
                    if node.meta.key_range.start == scan_end {
                        scan_end = node.meta.key_range.end.clone();
                        run_keys.push(key.clone());
                    } else {
                        // Scan past the gap up to the next known node.
                        expand_end = node.meta.key_range.start.clone();
                        break;
                    }
                }
                (Some(_), false) => {
                    expand_end = node.meta.key_range.start.clone();
                    break;
                }
            }
        }
        let Some(start) = scan_start else {
            return;
        };
        for key in run_keys {
            if let Some(node) = inner.nodes.get_mut(&key) {
                node.status = NodeStatus::Updating;
            }
        }
        inner.updating_count += 1;
        let cache = self.clone();
        let end = scan_end;
        tokio::spawn(async move {
            cache.scan_meta(start, end, expand_end).await;
        });
    }

    /// Root tablet address, with bounded retry while the value is empty.
    async fn root_tablet_addr(&self) -> Option<String> {
        for attempt in 0..=self.config.scan_retry {
            match self.coord.read_node(ROOT_TABLET_PATH) {
                Ok(Some(value)) if !value.is_empty() => {
                    return Some(String::from_utf8_lossy(&value).to_string());
                }
                _ => {
                    tracing::debug!(attempt, "root tablet address empty");
                    tokio::time::sleep(self.config.update_interval).await;
                }
            }
        }
        None
    }

    async fn scan_meta(self: Arc<Self>, start: Vec<u8>, end: Vec<u8>, expand_end: Vec<u8>) {
        let mut attempt = 0u32;
        loop {
            match self.scan_meta_once(&start, &expand_end).await {
                Ok(metas) => {
                    let covered = self.apply_scan_results(&start, &end, metas);
                    if covered {
                        let mut inner = self.inner.lock().unwrap();
                        inner.updating_count -= 1;
                        self.update_meta_async(&mut inner);
                        return;
                    }
                    tracing::warn!(
                        table = %self.table_name,
                        "meta scan returned incomplete coverage"
                    );
                }
                Err(status) => {
                    tracing::warn!(table = %self.table_name, %status, "meta scan failed");
                }
            }
            attempt += 1;
            if attempt > self.config.scan_retry {
                self.give_up_update(&start, &end);
                return;
            }
            tokio::time::sleep(self.config.update_interval * attempt).await;
        }
    }

    async fn scan_meta_once(
        &self,
        start: &[u8],
        expand_end: &[u8],
    ) -> Result<Vec<TabletMeta>, StatusCode> {
        let addr = self
            .root_tablet_addr()
            .await
            .ok_or(StatusCode::ConnectError)?;
        let node = self.router.node(&addr).ok_or(StatusCode::ConnectError)?;
        let (scan_start, scan_end) = meta_codec::meta_scan_range(&self.table_name, start, expand_end);

        let mut out = Vec::new();
        let mut cursor = scan_start;
        // Only the first page rounds down to the covering tablet record;
        // continuations already sit past it.
        let mut first_page = true;
        loop {
            let response = node
                .scan_tablet(ScanTabletRequest {
                    sequence_id: self.sequence.next(),
                    table_name: META_TABLE_NAME.to_string(),
                    start: cursor.clone(),
                    end: scan_end.clone(),
                    max_entries: self.config.scan_page,
                    round_down: first_page,
                })
                .await;
            first_page = false;
            if response.status != StatusCode::Ok {
                return Err(response.status);
            }
            let complete = response.complete;
            let Some(last) = response.entries.last() else {
                return Ok(out);
            };
            let mut next = last.key.clone();
            next.push(0x00);
            cursor = next;
            for entry in response.entries {
                if let Ok(MetaKey::Tablet { table, .. }) = meta_codec::decode_meta_key(&entry.key) {
                    if table == self.table_name {
                        if let Ok(meta) = meta_codec::decode_tablet_value(&entry.value) {
                            out.push(meta);
                        }
                    }
                }
            }
            if complete {
                return Ok(out);
            }
        }
    }

    /// Install scan results; returns whether [start, end) is now covered by
    /// Normal nodes.
    fn apply_scan_results(&self, start: &[u8], end: &[u8], metas: Vec<TabletMeta>) -> bool {
        let mut wakes = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        for meta in metas {
            if meta.server_addr.is_empty() {
                // A tablet mid-move has no routable address yet; leave the
                // stale entry (and its pending tasks) for the next round.
                continue;
            }
            if let Some(wake) = update_tablet_meta_list(&mut inner, meta) {
                wakes.push(wake);
            }
        }

        // Coverage check over the requested interval.
        let mut covered = true;
        let mut cursor = start.to_vec();
        loop {
            match lookup(&inner.nodes, &cursor) {
                Some((_, node)) if node.status == NodeStatus::Normal => {
                    let node_end = node.meta.key_range.end.clone();
                    if node_end.is_empty() || (!end.is_empty() && node_end.as_slice() >= end) {
                        break;
                    }
                    cursor = node_end;
                }
                _ => {
                    covered = false;
                    break;
                }
            }
        }
        drop(inner);
        for wake in wakes {
            let _ = self.wake_tx.send(wake);
        }
        covered
    }

    /// Fail every task parked in [start, end) after scan retries ran out.
    fn give_up_update(&self, start: &[u8], end: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let doomed_rows: Vec<Vec<u8>> = inner
            .pending
            .range(start.to_vec()..)
            .take_while(|(row, _)| end.is_empty() || row.as_slice() < end)
            .map(|(row, _)| row.clone())
            .collect();
        let mut task_ids = Vec::new();
        for row in doomed_rows {
            if let Some(ids) = inner.pending.remove(&row) {
                task_ids.extend(ids);
            }
        }
        // Drop placeholder/updating nodes so later requests start clean.
        let stale_nodes: Vec<Vec<u8>> = inner
            .nodes
            .range(start.to_vec()..)
            .take_while(|(key, _)| end.is_empty() || key.as_slice() < end)
            .filter(|(_, node)| node.status != NodeStatus::Normal)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale_nodes {
            inner.nodes.remove(&key);
        }
        inner.updating_count -= 1;
        drop(inner);
        tracing::warn!(
            table = %self.table_name,
            tasks = task_ids.len(),
            "meta update abandoned"
        );
        if !task_ids.is_empty() {
            let _ = self.wake_tx.send(MetaWake::Failed {
                task_ids,
                status: StatusCode::ConnectError,
            });
        }
    }

    /// Direct insertion hook used by cookie restore.
    pub fn install(&self, meta: TabletMeta, update_time_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        let start = meta.key_range.start.clone();
        inner.nodes.insert(
            start,
            TabletMetaNode {
                meta,
                status: NodeStatus::Normal,
                update_time_ms,
            },
        );
    }

    /// Snapshot of Normal entries, for cookie dumps.
    pub fn normal_entries(&self) -> Vec<TabletMeta> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Normal)
            .map(|n| n.meta.clone())
            .collect()
    }

    #[cfg(test)]
    fn node_for(&self, row: &[u8]) -> Option<TabletMetaNode> {
        let inner = self.inner.lock().unwrap();
        lookup(&inner.nodes, row).map(|(_, node)| node.clone())
    }
}

/// `upper_bound(row) - 1` with an end-bound containment check.
fn lookup<'a>(
    nodes: &'a BTreeMap<Vec<u8>, TabletMetaNode>,
    row: &[u8],
) -> Option<(&'a Vec<u8>, &'a TabletMetaNode)> {
    let (key, node) = nodes.range(..=row.to_vec()).next_back()?;
    let end = &node.meta.key_range.end;
    (end.is_empty() || end.as_slice() > row).then_some((key, node))
}

/// Insert a fresh meta record, shrinking/splitting/erasing overlapping stale
/// nodes (the four overlap cases), then wake tasks now covered by it.
fn update_tablet_meta_list(inner: &mut CacheInner, new_meta: TabletMeta) -> Option<MetaWake> {
    let new_start = new_meta.key_range.start.clone();
    let new_end = new_meta.key_range.end.clone();

    // Walk old nodes that can overlap [new_start, new_end).
    let mut cursor = {
        let mut iter = inner.nodes.range(..=new_start.clone());
        iter.next_back().map(|(key, _)| key.clone())
    };
    if cursor.is_none() {
        cursor = inner.nodes.keys().next().cloned();
    }
    while let Some(old_start) = cursor {
        let Some(old_node) = inner.nodes.get(&old_start) else {
            break;
        };
        let old_end = old_node.meta.key_range.end.clone();
        // Advance before mutating the map.
        cursor = inner
            .nodes
            .range((
                std::ops::Bound::Excluded(old_start.clone()),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .map(|(key, _)| key.clone());

        if old_start < new_start {
            if !old_end.is_empty() && old_end <= new_start {
                // old entirely before new: untouched.
            } else if new_end.is_empty() || (!old_end.is_empty() && old_end <= new_end) {
                // old overhangs new's left edge: shrink old to [old, new_start).
                if let Some(node) = inner.nodes.get_mut(&old_start) {
                    node.meta.key_range.end = new_start.clone();
                }
            } else {
                // old covers new entirely: split into left and right remnants.
                let mut right = old_node.clone();
                right.meta.key_range.start = new_end.clone();
                if let Some(node) = inner.nodes.get_mut(&old_start) {
                    node.meta.key_range.end = new_start.clone();
                }
                inner.nodes.insert(new_end.clone(), right);
            }
        } else if new_end.is_empty() || old_start < new_end {
            if new_end.is_empty() || (!old_end.is_empty() && old_end <= new_end) {
                // old inside new: superseded.
                inner.nodes.remove(&old_start);
            } else {
                // old overhangs new's right edge: keep [new_end, old_end).
                let mut right = old_node.clone();
                right.meta.key_range.start = new_end.clone();
                inner.nodes.remove(&old_start);
                inner.nodes.insert(new_end.clone(), right);
            }
        } else {
            // old entirely after new: done.
            break;
        }
    }

    let addr = new_meta.server_addr.clone();
    let update_time_ms = crate::unix_time_ms();
    inner.nodes.insert(
        new_start.clone(),
        TabletMetaNode {
            meta: new_meta,
            status: NodeStatus::Normal,
            update_time_ms,
        },
    );

    // Wake tasks whose row now falls inside the fresh node.
    let rows: Vec<Vec<u8>> = inner
        .pending
        .range(new_start.clone()..)
        .take_while(|(row, _)| new_end.is_empty() || row.as_slice() < new_end.as_slice())
        .map(|(row, _)| row.clone())
        .collect();
    let mut task_ids = Vec::new();
    for row in rows {
        if let Some(ids) = inner.pending.remove(&row) {
            task_ids.extend(ids);
        }
    }
    (!task_ids.is_empty()).then_some(MetaWake::Ready {
        task_ids,
        addr,
        meta_ts: update_time_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryRegistry;
    use crate::fake_node::FakeMetaNode;
    use crate::meta::{KeyRange, TabletStatus};
    use crate::meta_codec::MetaRecord;

    fn tablet_meta(start: &[u8], end: &[u8], addr: &str) -> TabletMeta {
        TabletMeta {
            table_name: "t".into(),
            path: "t/tablet00000001".into(),
            key_range: KeyRange::new(start, end),
            server_addr: addr.into(),
            status: TabletStatus::Ready,
            ..Default::default()
        }
    }

    fn seeded_cache_with_interval(
        tablets: &[(&[u8], &[u8], &str)],
        update_interval: Duration,
    ) -> (Arc<MetaCache>, mpsc::UnboundedReceiver<MetaWake>, Arc<FakeMetaNode>) {
        let registry = MemoryRegistry::new();
        let session = registry.session();
        session.set_node(ROOT_TABLET_PATH, b"meta-ts:1").unwrap();

        let router = RpcRouter::new();
        let fake = Arc::new(FakeMetaNode::new());
        for (start, end, addr) in tablets {
            let meta = tablet_meta(start, end, addr);
            let record = MetaRecord::for_tablet(&meta).unwrap();
            fake.insert(record.key, record.value);
        }
        router.register("meta-ts:1", fake.clone());

        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let cache = MetaCache::new(
            "t",
            MetaCacheConfig {
                update_interval,
                ..Default::default()
            },
            Arc::new(session),
            router,
            wake_tx,
        );
        (cache, wake_rx, fake)
    }

    fn seeded_cache(
        tablets: &[(&[u8], &[u8], &str)],
    ) -> (Arc<MetaCache>, mpsc::UnboundedReceiver<MetaWake>, Arc<FakeMetaNode>) {
        seeded_cache_with_interval(tablets, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn miss_coalesces_and_wakes_with_resolved_addr() {
        let (cache, mut wake_rx, _) = seeded_cache(&[(b"", b"m", "ts1:1"), (b"m", b"", "ts2:1")]);

        assert!(cache.resolve_or_enqueue(b"apple", 1, None, 0).is_none());
        assert!(cache.resolve_or_enqueue(b"apricot", 2, None, 0).is_none());

        let wake = wake_rx.recv().await.unwrap();
        match wake {
            MetaWake::Ready {
                mut task_ids,
                addr,
                ..
            } => {
                task_ids.sort();
                assert_eq!(task_ids, vec![1, 2]);
                assert_eq!(addr, "ts1:1");
            }
            other => panic!("unexpected wake: {other:?}"),
        }

        // Cache hit afterwards, no parking.
        let (addr, _) = cache.resolve_or_enqueue(b"apple", 3, None, 0).unwrap();
        assert_eq!(addr, "ts1:1");
        let (addr, _) = cache.resolve_or_enqueue(b"zebra", 4, None, 0).unwrap();
        assert_eq!(addr, "ts2:1");
    }

    #[tokio::test]
    async fn stale_fault_refetches_instead_of_reusing_entry() {
        let (cache, mut wake_rx, fake) = seeded_cache(&[(b"", b"", "ts1:1")]);

        assert!(cache.resolve_or_enqueue(b"k", 1, None, 0).is_none());
        let MetaWake::Ready { meta_ts, .. } = wake_rx.recv().await.unwrap() else {
            panic!("expected ready");
        };

        // Tablet split behind our back: meta now has two rows elsewhere.
        fake.insert(
            MetaRecord::for_tablet(&tablet_meta(b"", b"m", "ts2:1")).unwrap().key,
            MetaRecord::for_tablet(&tablet_meta(b"", b"m", "ts2:1")).unwrap().value,
        );
        fake.insert(
            MetaRecord::for_tablet(&tablet_meta(b"m", b"", "ts3:1")).unwrap().key,
            MetaRecord::for_tablet(&tablet_meta(b"m", b"", "ts3:1")).unwrap().value,
        );

        // Wait out the refetch rate limit, then report the stale fault.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let parked =
            cache.resolve_or_enqueue(b"k", 2, Some(StatusCode::KeyNotInRange), meta_ts);
        assert!(parked.is_none(), "stale entry must not be reused");

        let MetaWake::Ready { task_ids, addr, .. } = wake_rx.recv().await.unwrap() else {
            panic!("expected ready");
        };
        assert_eq!(task_ids, vec![2]);
        assert_eq!(addr, "ts2:1");
        // Subsequent lookups in the faulted range see the new server.
        let (addr, _) = cache.resolve_or_enqueue(b"k", 3, None, 0).unwrap();
        assert_eq!(addr, "ts2:1");
    }

    #[tokio::test]
    async fn refetch_within_interval_is_delayed() {
        // Interval large enough that the fault below is reliably "too soon".
        let (cache, mut wake_rx, _) =
            seeded_cache_with_interval(&[(b"", b"", "ts1:1")], Duration::from_millis(300));
        assert!(cache.resolve_or_enqueue(b"k", 1, None, 0).is_none());
        let MetaWake::Ready { meta_ts, .. } = wake_rx.recv().await.unwrap() else {
            panic!("expected ready");
        };

        // Immediate stale fault: node flips to DelayUpdate, not WaitUpdate.
        assert!(cache
            .resolve_or_enqueue(b"k", 2, Some(StatusCode::ConnectError), meta_ts)
            .is_none());
        assert_eq!(cache.node_for(b"k").unwrap().status, NodeStatus::DelayUpdate);

        // The delayed task eventually runs the refetch and wakes task 2.
        let MetaWake::Ready { task_ids, .. } = wake_rx.recv().await.unwrap() else {
            panic!("expected ready");
        };
        assert_eq!(task_ids, vec![2]);
    }

    #[test]
    fn overlap_rules_shrink_split_and_erase() {
        let mut inner = CacheInner {
            nodes: BTreeMap::new(),
            pending: BTreeMap::new(),
            updating_count: 0,
        };
        // Seed one wide node [b, y) then insert [f, m): split into three.
        update_tablet_meta_list(&mut inner, tablet_meta(b"b", b"y", "old"));
        update_tablet_meta_list(&mut inner, tablet_meta(b"f", b"m", "new"));
        let spans: Vec<(Vec<u8>, Vec<u8>, String)> = inner
            .nodes
            .values()
            .map(|n| {
                (
                    n.meta.key_range.start.clone(),
                    n.meta.key_range.end.clone(),
                    n.meta.server_addr.clone(),
                )
            })
            .collect();
        assert_eq!(
            spans,
            vec![
                (b"b".to_vec(), b"f".to_vec(), "old".to_string()),
                (b"f".to_vec(), b"m".to_vec(), "new".to_string()),
                (b"m".to_vec(), b"y".to_vec(), "old".to_string()),
            ]
        );

        // Insert [a, z): swallows everything.
        update_tablet_meta_list(&mut inner, tablet_meta(b"a", b"z", "wide"));
        assert_eq!(inner.nodes.len(), 1);
        let only = inner.nodes.values().next().unwrap();
        assert_eq!(only.meta.server_addr, "wide");

        // Insert [x, ""): shrinks the wide node's right side.
        update_tablet_meta_list(&mut inner, tablet_meta(b"x", b"", "tail"));
        let spans: Vec<(Vec<u8>, Vec<u8>)> = inner
            .nodes
            .values()
            .map(|n| (n.meta.key_range.start.clone(), n.meta.key_range.end.clone()))
            .collect();
        assert_eq!(
            spans,
            vec![(b"a".to_vec(), b"x".to_vec()), (b"x".to_vec(), Vec::new())]
        );
    }
}
