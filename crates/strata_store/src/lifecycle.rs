//! Tablet lifecycle orchestration: load, unload, split, merge, move.
//!
//! Every flow is an async task carrying `(tablet, retry)`; each step is
//! guarded by a status compare-and-swap, so a callback that completes after
//! the tablet has already transitioned (a stale RPC) simply drops out. Meta
//! is journaled before the in-memory catalog changes direction.

use std::sync::Arc;
use std::time::Duration;

use crate::master::MasterImpl;
use crate::meta::{TableStatus, TabletMeta, TabletStatus};
use crate::meta_codec::MetaRecord;
use crate::rpc::{
    CompactTabletRequest, LoadTabletRequest, SplitTabletRequest, UnloadTabletRequest,
    META_TABLE_NAME,
};
use crate::status::StatusCode;
use crate::tablet_manager::{Table, Tablet};

const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const REMOVAL_POLL: Duration = Duration::from_millis(100);

impl MasterImpl {
    // ---- load --------------------------------------------------------------

    /// Drive `tablet` towards Ready on `preferred` (or a scheduler pick).
    pub(crate) fn try_load_tablet(self: Arc<Self>, tablet: Tablet, preferred: String) {
        tokio::spawn(async move {
            self.load_tablet_flow(tablet, preferred, String::new(), 0)
                .await;
        });
    }

    fn load_tablet_flow(
        self: &Arc<Self>,
        tablet: Tablet,
        preferred: String,
        exclude: String,
        mut retry: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        let Some(table) = self.tablet_manager.find_table(&tablet.table_name()) else {
            return;
        };
        if table.name() != META_TABLE_NAME && table.status() != TableStatus::Enable {
            return;
        }
        if self.in_safe_mode() {
            tablet.set_status_if(TabletStatus::Pending, TabletStatus::Offline);
            return;
        }

        let Some(addr) = self.choose_load_target(&tablet, &preferred, &exclude) else {
            tablet.set_status_if(TabletStatus::Pending, TabletStatus::Offline);
            tracing::info!(tablet = %tablet.path(), "no load candidates; tablet pending");
            return;
        };

        // Offline/Pending -> WaitLoad with the destination recorded.
        let queued = tablet.set_addr_and_status_if(&addr, TabletStatus::WaitLoad, TabletStatus::Offline)
            || tablet.set_addr_and_status_if(&addr, TabletStatus::WaitLoad, TabletStatus::Pending);
        if !queued {
            return;
        }

        // Journal the placement before the node learns about it.
        let record = match tablet.to_meta_record() {
            Ok(record) => record,
            Err(err) => {
                tracing::error!(error = ?err, "tablet meta encode failed");
                return;
            }
        };
        if self.meta_pipeline.write(vec![record]).await != StatusCode::Ok {
            tablet.set_addr("");
            tablet.set_status_if(TabletStatus::Pending, TabletStatus::WaitLoad);
            return;
        }

        if !tablet.set_status_if(TabletStatus::OnLoad, TabletStatus::WaitLoad) {
            return;
        }

        loop {
            let meta = tablet.meta();
            let status = self.send_load(&table, &meta, &addr).await;
            if status == StatusCode::Ok {
                if tablet.set_status_if(TabletStatus::Ready, TabletStatus::OnLoad) {
                    tablet.mark_loaded();
                    tablet.set_expect_server_addr("");
                    tracing::info!(tablet = %tablet.path(), addr, "tablet ready");
                    // The table may have been disabled while the load was in
                    // flight; take the tablet straight back off the node.
                    if table.name() != META_TABLE_NAME && table.status() != TableStatus::Enable {
                        self.clone().try_unload_tablet_for_disable(tablet);
                    }
                }
                return;
            }
            if !tablet.set_status_if(TabletStatus::LoadFail, TabletStatus::OnLoad) {
                return;
            }
            tracing::warn!(tablet = %tablet.path(), addr, %status, retry, "tablet load failed");
            if retry < self.config.load_retry_max {
                retry += 1;
                tokio::time::sleep(RETRY_BACKOFF * retry).await;
                if !tablet.set_status_if(TabletStatus::OnLoad, TabletStatus::LoadFail) {
                    return;
                }
                continue;
            }
            // Out of retries on this server: move elsewhere or park Pending.
            if !tablet.set_status_if(TabletStatus::Offline, TabletStatus::LoadFail) {
                return;
            }
            tablet.set_addr("");
            let master = self.clone();
            tokio::spawn(async move {
                master
                    .load_tablet_flow(tablet, String::new(), addr, 0)
                    .await;
            });
            return;
        }
        })
    }

    fn choose_load_target(
        &self,
        tablet: &Tablet,
        preferred: &str,
        exclude: &str,
    ) -> Option<String> {
        let alive = |addr: &str| {
            !addr.is_empty() && addr != exclude && self.node_manager.find_node(addr).is_some()
        };
        if alive(preferred) {
            return Some(preferred.to_string());
        }
        let expect = tablet.expect_server_addr();
        if alive(&expect) {
            return Some(expect);
        }
        self.node_manager
            .ready_nodes()
            .into_iter()
            .filter(|n| n.addr() != exclude)
            .min_by_key(|n| (n.tablet_count(), n.addr()))
            .map(|n| n.addr())
    }

    async fn send_load(&self, table: &Table, meta: &TabletMeta, addr: &str) -> StatusCode {
        let Some(rpc) = self.router.node(addr) else {
            return StatusCode::ConnectError;
        };
        let response = rpc
            .load_tablet(LoadTabletRequest {
                sequence_id: self.sequence.next(),
                tablet: meta.clone(),
                schema: table.schema(),
                lineage: meta.parents.clone(),
                snapshots: meta.snapshots.clone(),
                rollbacks: meta.rollbacks.clone(),
            })
            .await;
        response.status
    }

    // ---- unload ------------------------------------------------------------

    async fn send_unload(&self, addr: &str, table_name: &str, key_start: &[u8]) -> StatusCode {
        let Some(rpc) = self.router.node(addr) else {
            return StatusCode::ConnectError;
        };
        let response = rpc
            .unload_tablet(UnloadTabletRequest {
                sequence_id: self.sequence.next(),
                table_name: table_name.to_string(),
                key_start: key_start.to_vec(),
            })
            .await;
        response.status
    }

    /// Unload with bounded retries; the tablet must already be Unloading or
    /// OnMerge/OnSplit (where unload is a step, not a state).
    async fn unload_with_retry(self: &Arc<Self>, tablet: &Tablet, addr: &str) -> bool {
        let table_name = tablet.table_name();
        let start = tablet.key_range().start;
        for retry in 0..=self.config.load_retry_max {
            let status = self.send_unload(addr, &table_name, &start).await;
            if status == StatusCode::Ok || status == StatusCode::KeyNotInRange {
                // KeyNotInRange means the node no longer serves it; done.
                return true;
            }
            tracing::warn!(tablet = %tablet.path(), addr, %status, retry, "tablet unload failed");
            tokio::time::sleep(RETRY_BACKOFF * (retry + 1)).await;
        }
        false
    }

    /// Disable-path unload: Ready tablets come fully offline.
    pub(crate) fn try_unload_tablet_for_disable(self: Arc<Self>, tablet: Tablet) {
        tokio::spawn(async move {
            let addr = tablet.server_addr();
            if !tablet.set_status_if(TabletStatus::Unloading, TabletStatus::Ready) {
                return;
            }
            if self.unload_with_retry(&tablet, &addr).await {
                if tablet.set_status_if(TabletStatus::Unloaded, TabletStatus::Unloading) {
                    tablet.set_addr("");
                    tablet.set_status_if(TabletStatus::Offline, TabletStatus::Unloaded);
                }
            } else {
                // The server is wedged; evict it and let the watch recover us.
                tablet.set_status_if(TabletStatus::UnLoadFail, TabletStatus::Unloading);
                self.try_kick_tablet_node(&addr);
            }
        });
    }

    /// A node reported a tablet the catalog does not know: unload it there.
    pub(crate) fn unload_zombie(self: Arc<Self>, addr: String, meta: TabletMeta) {
        tokio::spawn(async move {
            let status = self.send_unload(&addr, &meta.table_name, &meta.key_range.start).await;
            if status != StatusCode::Ok {
                tracing::warn!(addr, table = %meta.table_name, %status, "zombie unload failed");
            }
        });
    }

    // ---- move --------------------------------------------------------------

    /// Graceful move: unload from the current server, journal the new
    /// placement, load on the target.
    pub(crate) fn try_move_tablet(self: Arc<Self>, tablet: Tablet, target: String) {
        tokio::spawn(async move {
            if self.in_safe_mode() {
                return;
            }
            let source = tablet.server_addr();
            if source == target {
                return;
            }
            if !tablet.set_status_if(TabletStatus::Unloading, TabletStatus::Ready) {
                return;
            }
            tablet.set_expect_server_addr(&target);
            if !self.unload_with_retry(&tablet, &source).await {
                tablet.set_status_if(TabletStatus::UnLoadFail, TabletStatus::Unloading);
                self.try_kick_tablet_node(&source);
                return;
            }
            if !tablet.set_status_if(TabletStatus::Unloaded, TabletStatus::Unloading) {
                return;
            }
            if !tablet.set_status_if(TabletStatus::Offline, TabletStatus::Unloaded) {
                return;
            }
            tablet.set_addr("");
            self.load_tablet_flow(tablet, target, source, 0).await;
        });
    }

    // ---- split -------------------------------------------------------------

    /// Split `tablet` at a server-computed key into two fresh children.
    pub(crate) fn try_split_tablet(self: Arc<Self>, tablet: Tablet) {
        tokio::spawn(async move {
            if self.in_safe_mode() {
                return;
            }
            let Some(table) = self.tablet_manager.find_table(&tablet.table_name()) else {
                return;
            };
            if !tablet.set_status_if(TabletStatus::OnSplit, TabletStatus::Ready) {
                return;
            }
            let addr = tablet.server_addr();
            let range = tablet.key_range();

            let split_key = match self.request_split_key(&tablet, &addr).await {
                Some(key) => key,
                None => {
                    tablet.set_status_if(TabletStatus::Ready, TabletStatus::OnSplit);
                    return;
                }
            };
            let in_bounds = (range.start.is_empty() || split_key > range.start)
                && (range.end.is_empty() || split_key < range.end);
            if !in_bounds {
                tracing::warn!(tablet = %tablet.path(), "split key out of bounds; split abandoned");
                tablet.set_status_if(TabletStatus::Ready, TabletStatus::OnSplit);
                return;
            }

            // The parent must be off the serving path before its row is
            // replaced, or writes could land in a deleted range.
            if !self.unload_with_retry(&tablet, &addr).await {
                if tablet.set_status_if(TabletStatus::SplitFail, TabletStatus::OnSplit) {
                    tablet.set_status_if(TabletStatus::Offline, TabletStatus::SplitFail);
                    tablet.set_addr("");
                    self.clone().try_load_tablet(tablet, String::new());
                }
                return;
            }

            let parent_meta = tablet.meta();
            let parent_num = tablet.tablet_num();
            let mut lineage = vec![parent_num];
            lineage.extend(parent_meta.parents.iter().copied());

            let left_num = table.next_tablet_num();
            let right_num = table.next_tablet_num();
            let children = [
                child_meta(&parent_meta, left_num, range.start.clone(), split_key.clone(), &lineage),
                child_meta(&parent_meta, right_num, split_key.clone(), range.end.clone(), &lineage),
            ];

            // Single batched commit: table counter, both children, parent gone.
            let records = match split_records(&table, &children, &tablet) {
                Ok(records) => records,
                Err(err) => {
                    tracing::error!(error = ?err, "split meta encode failed");
                    return;
                }
            };
            let mut committed = false;
            for retry in 0..=self.config.load_retry_max {
                if self.meta_pipeline.write(records.clone()).await == StatusCode::Ok {
                    committed = true;
                    break;
                }
                tokio::time::sleep(RETRY_BACKOFF * (retry + 1)).await;
            }
            if !committed {
                // Meta still holds the parent row: reload the parent as-is.
                tracing::error!(tablet = %tablet.path(), "split meta write failed; reloading parent");
                if tablet.set_status_if(TabletStatus::SplitFail, TabletStatus::OnSplit) {
                    tablet.set_status_if(TabletStatus::Offline, TabletStatus::SplitFail);
                    tablet.set_addr("");
                    self.clone().try_load_tablet(tablet, String::new());
                }
                return;
            }

            tablet.set_status_if(TabletStatus::Splited, TabletStatus::OnSplit);
            table.remove_tablet(&range.start);
            tablet.set_status_if(TabletStatus::Deleted, TabletStatus::Splited);
            tracing::info!(
                parent = %tablet.path(),
                split_key = %String::from_utf8_lossy(&split_key),
                left = left_num,
                right = right_num,
                "tablet split committed"
            );

            for meta in children {
                let child = Tablet::new(meta);
                table.add_tablet(child.clone());
                // Children start on the parent's server to reuse its cache.
                self.clone().try_load_tablet(child, addr.clone());
            }
        });
    }

    async fn request_split_key(&self, tablet: &Tablet, addr: &str) -> Option<Vec<u8>> {
        let rpc = self.router.node(addr)?;
        let response = rpc
            .split_tablet(SplitTabletRequest {
                sequence_id: self.sequence.next(),
                table_name: tablet.table_name(),
                key_start: tablet.key_range().start,
            })
            .await;
        if response.status != StatusCode::Ok || response.split_key.is_empty() {
            tracing::info!(tablet = %tablet.path(), status = %response.status, "no split key");
            return None;
        }
        Some(response.split_key)
    }

    // ---- merge -------------------------------------------------------------

    /// Merge `tablet` with an adjacent partner into one fresh child.
    pub(crate) fn try_merge_tablet(self: Arc<Self>, tablet: Tablet) {
        tokio::spawn(async move {
            if self.in_safe_mode() {
                return;
            }
            let Some((left, right)) = self.tablet_manager.pick_merge_pair(&tablet) else {
                tracing::info!(tablet = %tablet.path(), "no merge partner");
                return;
            };
            let Some(table) = self.tablet_manager.find_table(&left.table_name()) else {
                return;
            };
            if !left.set_status_if(TabletStatus::OnMerge, TabletStatus::Ready) {
                return;
            }
            if !right.set_status_if(TabletStatus::OnMerge, TabletStatus::Ready) {
                left.set_status_if(TabletStatus::Ready, TabletStatus::OnMerge);
                return;
            }

            let mut aborted = false;
            for parent in [&left, &right] {
                let addr = parent.server_addr();
                if !self.unload_with_retry(parent, &addr).await {
                    aborted = true;
                    break;
                }
            }
            if aborted {
                for parent in [&left, &right] {
                    if parent.set_status_if(TabletStatus::Offline, TabletStatus::OnMerge) {
                        parent.set_addr("");
                        self.clone().try_load_tablet(parent.clone(), String::new());
                    }
                }
                return;
            }

            let left_meta = left.meta();
            let right_meta = right.meta();
            let mut lineage = vec![left.tablet_num(), right.tablet_num()];
            lineage.extend(left_meta.parents.iter().copied());
            lineage.extend(right_meta.parents.iter().copied());

            let child_num = table.next_tablet_num();
            let child = child_meta(
                &left_meta,
                child_num,
                left_meta.key_range.start.clone(),
                right_meta.key_range.end.clone(),
                &lineage,
            );

            let records = match merge_records(&table, &child, &left, &right) {
                Ok(records) => records,
                Err(err) => {
                    tracing::error!(error = ?err, "merge meta encode failed");
                    return;
                }
            };
            let mut committed = false;
            for retry in 0..=self.config.load_retry_max {
                if self.meta_pipeline.write(records.clone()).await == StatusCode::Ok {
                    committed = true;
                    break;
                }
                tokio::time::sleep(RETRY_BACKOFF * (retry + 1)).await;
            }
            if !committed {
                tracing::error!("merge meta write failed; reloading both parents");
                for parent in [&left, &right] {
                    if parent.set_status_if(TabletStatus::Offline, TabletStatus::OnMerge) {
                        parent.set_addr("");
                        self.clone().try_load_tablet(parent.clone(), String::new());
                    }
                }
                return;
            }

            for parent in [&left, &right] {
                parent.set_status_if(TabletStatus::Unloaded, TabletStatus::OnMerge);
                table.remove_tablet(&parent.key_range().start);
                parent.set_status_if(TabletStatus::Deleted, TabletStatus::Unloaded);
            }
            tracing::info!(
                left = %left.path(),
                right = %right.path(),
                child = child_num,
                "tablet merge committed"
            );
            let child = Tablet::new(child);
            table.add_tablet(child.clone());
            self.clone().try_load_tablet(child, left_meta.server_addr);
        });
    }

    // ---- delete ------------------------------------------------------------

    /// Deletion path for one tablet of a Deleting table.
    pub(crate) fn delete_tablet_async(self: Arc<Self>, tablet: Tablet) {
        tokio::spawn(async move {
            // Serving tablets must come off their node first.
            if tablet.set_status_if(TabletStatus::Unloading, TabletStatus::Ready) {
                let addr = tablet.server_addr();
                if self.unload_with_retry(&tablet, &addr).await {
                    tablet.set_status_if(TabletStatus::Unloaded, TabletStatus::Unloading);
                } else {
                    tablet.set_status_if(TabletStatus::UnLoadFail, TabletStatus::Unloading);
                    tablet.set_status_if(TabletStatus::Offline, TabletStatus::UnLoadFail);
                }
            }

            // Failure sinks drain to Offline so deletion can terminate.
            for from in [
                TabletStatus::LoadFail,
                TabletStatus::UnLoadFail,
                TabletStatus::SplitFail,
            ] {
                tablet.set_status_if(TabletStatus::Offline, from);
            }

            let record = tablet.to_delete_record();
            if self.meta_pipeline.write(vec![record]).await != StatusCode::Ok {
                tracing::error!(tablet = %tablet.path(), "tablet delete journal failed");
                return;
            }
            for from in [
                TabletStatus::Unloaded,
                TabletStatus::Offline,
                TabletStatus::Pending,
                TabletStatus::WaitLoad,
            ] {
                if tablet.set_status_if(TabletStatus::Deleted, from) {
                    break;
                }
            }
            if let Some(table) = self.tablet_manager.find_table(&tablet.table_name()) {
                table.add_deleted_tablet_count();
            }
            tracing::info!(tablet = %tablet.path(), "tablet deleted");
        });
    }

    /// Wait for a Deleting table to empty out, then drop its record, its
    /// catalog entry, its GC state, and its directory.
    pub(crate) fn finish_table_removal_when_empty(self: Arc<Self>, table: Table) {
        tokio::spawn(async move {
            loop {
                if table.ready_for_removal() {
                    break;
                }
                tokio::time::sleep(REMOVAL_POLL).await;
            }
            let name = table.name();
            let record = MetaRecord::delete(crate::meta_codec::encode_table_key(&name));
            if self.meta_pipeline.write(vec![record]).await != StatusCode::Ok {
                tracing::error!(table = %name, "table record delete failed");
                return;
            }
            self.tablet_manager.delete_table(&name);
            self.gc.clear_table(&name);
            let dir = self.config.root_dir.join(&name);
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(table = %name, error = %err, "table dir removal failed");
                }
            }
            tracing::info!(table = %name, "table dropped");
        });
    }

    // ---- compact -----------------------------------------------------------

    /// Major-compact every tablet of a table (CLI `compact`).
    pub async fn compact_table(self: &Arc<Self>, token: &str, name: &str) -> Result<(), StatusCode> {
        if !self.user_manager.has_permission(token) {
            return Err(StatusCode::NotPermission);
        }
        let table = self
            .tablet_manager
            .resolve_table(name)
            .ok_or(StatusCode::TableNotFound)?;
        for tablet in table.tablets() {
            let addr = tablet.server_addr();
            let Some(rpc) = self.router.node(&addr) else {
                continue;
            };
            let response = rpc
                .compact_tablet(CompactTabletRequest {
                    sequence_id: self.sequence.next(),
                    table_name: table.name(),
                    key_start: tablet.key_range().start,
                })
                .await;
            if response.status != StatusCode::Ok {
                return Err(response.status);
            }
        }
        Ok(())
    }

    // ---- CLI entry points --------------------------------------------------

    /// Split the tablet containing `row`.
    pub fn split_tablet_cmd(self: &Arc<Self>, name: &str, row: &[u8]) -> Result<(), StatusCode> {
        let table = self
            .tablet_manager
            .resolve_table(name)
            .ok_or(StatusCode::TableNotFound)?;
        let tablet = table
            .find_tablet_for_key(row)
            .ok_or(StatusCode::KeyNotInRange)?;
        self.clone().try_split_tablet(tablet);
        Ok(())
    }

    /// Merge the tablet containing `row` with a neighbor.
    pub fn merge_tablet_cmd(self: &Arc<Self>, name: &str, row: &[u8]) -> Result<(), StatusCode> {
        let table = self
            .tablet_manager
            .resolve_table(name)
            .ok_or(StatusCode::TableNotFound)?;
        let tablet = table
            .find_tablet_for_key(row)
            .ok_or(StatusCode::KeyNotInRange)?;
        self.clone().try_merge_tablet(tablet);
        Ok(())
    }

    /// Move the tablet containing `row` to `target` (or a scheduler pick).
    pub fn move_tablet_cmd(
        self: &Arc<Self>,
        name: &str,
        row: &[u8],
        target: Option<String>,
    ) -> Result<(), StatusCode> {
        let table = self
            .tablet_manager
            .resolve_table(name)
            .ok_or(StatusCode::TableNotFound)?;
        let tablet = table
            .find_tablet_for_key(row)
            .ok_or(StatusCode::KeyNotInRange)?;
        let target = match target {
            Some(addr) => addr,
            None => self
                .pick_least_loaded_node()
                .map(|n| n.addr())
                .ok_or(StatusCode::ServerUnavailable)?,
        };
        self.clone().try_move_tablet(tablet, target);
        Ok(())
    }
}

fn child_meta(
    parent: &TabletMeta,
    num: u64,
    start: Vec<u8>,
    end: Vec<u8>,
    lineage: &[u64],
) -> TabletMeta {
    TabletMeta {
        table_name: parent.table_name.clone(),
        path: crate::meta::tablet_path(&parent.table_name, num),
        key_range: crate::meta::KeyRange::new(start, end),
        server_addr: String::new(),
        status: TabletStatus::Offline,
        snapshots: parent.snapshots.clone(),
        rollbacks: parent.rollbacks.clone(),
        parents: lineage.to_vec(),
        ..Default::default()
    }
}

fn split_records(
    table: &Table,
    children: &[TabletMeta; 2],
    parent: &Tablet,
) -> anyhow::Result<Vec<MetaRecord>> {
    let mut records = vec![table.to_meta_record()?];
    for child in children {
        records.push(MetaRecord::for_tablet(child)?);
    }
    // The left child reuses the parent's start key, so its put overwrites the
    // parent row; an explicit delete would clobber the child. Only emit the
    // delete when the keys differ.
    if children[0].key_range.start != parent.key_range().start {
        records.push(parent.to_delete_record());
    }
    Ok(records)
}

fn merge_records(
    table: &Table,
    child: &TabletMeta,
    left: &Tablet,
    right: &Tablet,
) -> anyhow::Result<Vec<MetaRecord>> {
    let mut records = vec![table.to_meta_record()?, MetaRecord::for_tablet(child)?];
    if child.key_range.start != left.key_range().start {
        records.push(left.to_delete_record());
    }
    records.push(right.to_delete_record());
    Ok(records)
}
