//! Master coordination engine.
//!
//! Startup: claim the master lock, census the registered tablet servers,
//! place (or adopt) the meta tablet, load the meta table into RAM, reconcile
//! reported tablets against it, then run the control loop: periodic node
//! queries, load-balance ticks, GC rounds, and availability checks.
//!
//! Every state-changing decision is journaled through the meta pipeline
//! first; the in-memory catalog changes only after the meta write succeeds.
//! Tablet-level orchestration (load/unload/split/merge/move) lives in
//! `lifecycle.rs` as further methods on `MasterImpl`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;

use crate::balancer::{BalancerConfig, LoadBalancer, LoadScheduler, SizeScheduler};
use crate::coordination::{
    kick_path_for, Coordination, WatchEvent, WatchEventKind, MASTER_LOCK_PATH, ROOT_TABLET_PATH,
    SAFEMODE_PATH, TS_LIST_PATH,
};
use crate::gc::{BatchGcStrategy, GcStrategy, IncrementalGcStrategy};
use crate::meta::{
    KeyRange, TableMeta, TableSchema, TableStatus, TabletMeta, TabletStatus, UserMeta,
};
use crate::meta_codec::{self, MetaKey, MetaRecord};
use crate::meta_pipeline::{MetaOpsPipeline, MetaPipelineConfig};
use crate::node_manager::{NodeState, TabletNode, TabletNodeManager};
use crate::rpc::{
    LoadTabletRequest, QueryRequest, QueryResponse, RpcRouter, SequenceId, TabletReport,
    UpdateSchemaRequest, META_TABLE_NAME,
};
use crate::status::StatusCode;
use crate::tablet_manager::{Table, Tablet, TabletManager};
use crate::user_manager::{UserManager, ROOT_USER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    Batch,
    Incremental,
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub addr: String,
    /// Shared filesystem root holding every tablet directory.
    pub root_dir: PathBuf,
    pub load_retry_max: u32,
    pub query_interval: Duration,
    pub balance_interval: Duration,
    pub gc_interval: Duration,
    pub availability_interval: Duration,
    /// Consecutive failed query rounds before a node is kicked.
    pub kick_after_query_failures: u32,
    pub gc_strategy: GcKind,
    pub load_balance_enabled: bool,
    /// Online schema change; off means structural edits need a disabled table.
    pub online_schema_update: bool,
    pub meta_pipeline: MetaPipelineConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            addr: "master:7770".to_string(),
            root_dir: PathBuf::from("./data"),
            load_retry_max: 3,
            query_interval: Duration::from_millis(500),
            balance_interval: Duration::from_secs(5),
            gc_interval: Duration::from_secs(10),
            availability_interval: Duration::from_secs(2),
            kick_after_query_failures: 3,
            gc_strategy: GcKind::Incremental,
            load_balance_enabled: true,
            online_schema_update: true,
            meta_pipeline: MetaPipelineConfig::default(),
        }
    }
}

pub struct MasterImpl {
    pub(crate) config: MasterConfig,
    pub(crate) coord: Arc<dyn Coordination>,
    pub(crate) router: RpcRouter,
    pub(crate) sequence: Arc<SequenceId>,
    pub(crate) tablet_manager: Arc<TabletManager>,
    pub(crate) node_manager: Arc<TabletNodeManager>,
    pub(crate) user_manager: Arc<UserManager>,
    pub(crate) meta_pipeline: MetaOpsPipeline,
    pub(crate) gc: Arc<dyn GcStrategy>,
    pub(crate) balancer: LoadBalancer,
    pub(crate) size_scheduler: SizeScheduler,
    pub(crate) load_scheduler: LoadScheduler,
    pub(crate) safe_mode: AtomicBool,
    /// Set when safe mode was entered automatically (node loss), which is
    /// the only kind the master may also leave automatically.
    auto_safe_mode: AtomicBool,
    pub(crate) meta_tablet: Mutex<Option<Tablet>>,
    running: AtomicBool,
}

impl MasterImpl {
    /// Acquire mastership and start the control loop. Blocks (asynchronously)
    /// until the master lock is held.
    pub async fn start(
        config: MasterConfig,
        coord: Arc<dyn Coordination>,
        router: RpcRouter,
    ) -> anyhow::Result<Arc<Self>> {
        loop {
            match coord.create_node(MASTER_LOCK_PATH, config.addr.as_bytes(), true) {
                Ok(()) => break,
                Err(_) => {
                    tracing::info!("waiting for master lock");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
        tracing::info!(addr = %config.addr, "master lock acquired");

        let sequence = Arc::new(SequenceId::new());
        let tablet_manager = Arc::new(TabletManager::new());
        let meta_pipeline = MetaOpsPipeline::spawn(
            router.clone(),
            sequence.clone(),
            String::new(),
            config.meta_pipeline,
        );
        let gc: Arc<dyn GcStrategy> = match config.gc_strategy {
            GcKind::Batch => Arc::new(BatchGcStrategy::new(
                tablet_manager.clone(),
                config.root_dir.clone(),
            )),
            GcKind::Incremental => Arc::new(IncrementalGcStrategy::new(
                tablet_manager.clone(),
                config.root_dir.clone(),
            )),
        };

        let master = Arc::new(Self {
            balancer: LoadBalancer::new(BalancerConfig::default()),
            size_scheduler: SizeScheduler::default(),
            load_scheduler: LoadScheduler::default(),
            config,
            coord,
            router,
            sequence,
            tablet_manager,
            node_manager: Arc::new(TabletNodeManager::new()),
            user_manager: Arc::new(UserManager::new()),
            meta_pipeline,
            gc,
            safe_mode: AtomicBool::new(false),
            auto_safe_mode: AtomicBool::new(false),
            meta_tablet: Mutex::new(None),
            running: AtomicBool::new(true),
        });

        // Session loss is fatal: stop making placement decisions immediately.
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        master.coord.watch_session(session_tx);
        {
            let master = master.clone();
            tokio::spawn(async move {
                if session_rx.recv().await.is_some() {
                    tracing::error!("master coordination session lost, stopping");
                    master.running.store(false, Ordering::SeqCst);
                }
            });
        }

        // Safe mode may predate this master incarnation.
        if master.coord.read_node(SAFEMODE_PATH)?.is_some() {
            master.safe_mode.store(true, Ordering::SeqCst);
            tracing::warn!("starting inside safe mode");
        }

        master.restore().await?;
        master.clone().spawn_timers();
        Ok(master)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn in_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    pub fn tablet_manager(&self) -> &Arc<TabletManager> {
        &self.tablet_manager
    }

    pub fn node_manager(&self) -> &Arc<TabletNodeManager> {
        &self.node_manager
    }

    /// Address currently serving the meta tablet, if placed.
    pub fn meta_tablet_addr(&self) -> Option<String> {
        self.meta_tablet
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| t.server_addr())
    }

    // ---- startup -----------------------------------------------------------

    async fn restore(self: &Arc<Self>) -> anyhow::Result<()> {
        let registrations = self.coord.list_children(TS_LIST_PATH)?;
        for (uuid, addr_bytes) in &registrations {
            let addr = String::from_utf8_lossy(addr_bytes).to_string();
            self.register_node(&addr, uuid);
        }

        // Census every live node before touching meta.
        let mut reports: Vec<(String, QueryResponse)> = Vec::new();
        for node in self.node_manager.nodes() {
            let addr = node.addr();
            if let Some(rpc) = self.router.node(&addr) {
                let response = rpc
                    .query(QueryRequest {
                        sequence_id: self.sequence.next(),
                        is_gc: false,
                    })
                    .await;
                reports.push((addr, response));
            }
        }

        // Adopt a reported meta tablet or place a fresh one.
        let adopted = reports.iter().find_map(|(addr, response)| {
            response
                .tablets
                .iter()
                .any(|t| t.meta.table_name == META_TABLE_NAME)
                .then(|| addr.clone())
        });
        match adopted {
            Some(addr) => self.adopt_meta_tablet(&addr).await?,
            None => {
                if let Some(node) = self.pick_least_loaded_node() {
                    self.place_meta_tablet(&node.addr()).await?;
                }
            }
        }

        if self.meta_tablet_addr().is_some() {
            self.load_meta_table().await?;
            self.ensure_root_user().await;
        } else {
            tracing::warn!("no tablet servers registered; meta tablet unplaced");
        }

        // Reconcile what the fleet is actually serving with what meta says.
        for (addr, response) in &reports {
            self.reconcile_reports(addr, &response.tablets).await;
        }

        // Whatever meta knows about and nobody serves gets (re)loaded.
        let offline: Vec<Tablet> = self
            .tablet_manager
            .user_tables()
            .iter()
            .flat_map(|t| t.tablets())
            .filter(|t| matches!(t.status(), TabletStatus::NotInit | TabletStatus::Offline))
            .collect();
        for tablet in offline {
            if tablet.status() == TabletStatus::NotInit {
                if !tablet.set_status(TabletStatus::Offline) {
                    continue;
                }
            }
            self.clone().try_load_tablet(tablet, String::new());
        }
        Ok(())
    }

    /// Make the catalog entry for the meta table itself.
    fn meta_table_entry(&self, addr: &str, status: TabletStatus) -> (Table, Tablet) {
        let mut table_meta = TableMeta::new(TableSchema::kv(META_TABLE_NAME), crate::unix_time_ms());
        table_meta.status = TableStatus::Enable;
        table_meta.next_tablet_num = 2;
        let tablet = Tablet::new(TabletMeta {
            table_name: META_TABLE_NAME.to_string(),
            path: crate::meta::tablet_path(META_TABLE_NAME, 1),
            key_range: KeyRange::whole(),
            server_addr: addr.to_string(),
            status,
            ..Default::default()
        });
        let table = Table::new(table_meta);
        table.add_tablet(tablet.clone());
        (table, tablet)
    }

    async fn adopt_meta_tablet(self: &Arc<Self>, addr: &str) -> anyhow::Result<()> {
        tracing::info!(addr, "adopting reported meta tablet");
        let (table, tablet) = self.meta_table_entry(addr, TabletStatus::NotInit);
        anyhow::ensure!(tablet.set_status(TabletStatus::Ready), "meta adopt edge");
        let _ = self.tablet_manager.add_table(table);
        *self.meta_tablet.lock().unwrap() = Some(tablet);
        self.publish_root_addr(addr)?;
        Ok(())
    }

    /// Load the meta tablet onto `addr` synchronously and publish it.
    pub(crate) async fn place_meta_tablet(self: &Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let Some(rpc) = self.router.node(addr) else {
            anyhow::bail!("meta placement target {addr} unreachable");
        };
        let (table, tablet) = self.meta_table_entry(addr, TabletStatus::NotInit);
        let response = rpc
            .load_tablet(LoadTabletRequest {
                sequence_id: self.sequence.next(),
                tablet: tablet.meta(),
                schema: table.schema(),
                lineage: Vec::new(),
                snapshots: Vec::new(),
                rollbacks: Vec::new(),
            })
            .await;
        anyhow::ensure!(
            response.status == StatusCode::Ok,
            "meta tablet load on {addr} failed: {}",
            response.status
        );
        anyhow::ensure!(tablet.set_status(TabletStatus::Ready), "meta load edge");
        let _ = self.tablet_manager.add_table(table);
        *self.meta_tablet.lock().unwrap() = Some(tablet);
        self.publish_root_addr(addr)?;
        tracing::info!(addr, "meta tablet placed");
        Ok(())
    }

    pub(crate) fn publish_root_addr(&self, addr: &str) -> anyhow::Result<()> {
        self.coord
            .set_node(ROOT_TABLET_PATH, addr.as_bytes())
            .context("publish root tablet addr")?;
        self.meta_pipeline.resume(addr);
        Ok(())
    }

    /// Read the whole meta table back into the catalog and user manager.
    async fn load_meta_table(self: &Arc<Self>) -> anyhow::Result<()> {
        let rows = self
            .meta_pipeline
            .scan(Vec::new(), Vec::new())
            .await
            .map_err(|code| anyhow::anyhow!("meta scan failed: {code}"))?;
        let mut tables = 0usize;
        let mut tablets = 0usize;
        let mut users = 0usize;
        for row in rows {
            match meta_codec::decode_meta_key(&row.key)? {
                MetaKey::Table(_) => {
                    self.tablet_manager.load_table_meta(&row.value)?;
                    tables += 1;
                }
                MetaKey::Tablet { .. } => {
                    self.tablet_manager.load_tablet_meta(&row.value)?;
                    tablets += 1;
                }
                MetaKey::User(_) => {
                    let meta: UserMeta = meta_codec::decode_user_value(&row.value)?;
                    self.user_manager.load_user_meta(meta);
                    users += 1;
                }
            }
        }
        tracing::info!(tables, tablets, users, "meta table loaded");

        // Surface corruption before issuing any placement decisions.
        for table in self.tablet_manager.user_tables() {
            if table.status() != TableStatus::Enable {
                continue;
            }
            if let Err(at) = self.tablet_manager.check_table_coverage(&table) {
                tracing::error!(
                    table = %table.name(),
                    at = %String::from_utf8_lossy(&at),
                    "meta range corruption detected; entering safe mode"
                );
                self.enter_safe_mode()?;
            }
        }
        Ok(())
    }

    async fn ensure_root_user(self: &Arc<Self>) {
        if self.user_manager.is_known(ROOT_USER) {
            return;
        }
        if let Ok(meta) = self.user_manager.prepare_create(ROOT_USER, ROOT_USER) {
            if let Ok(record) = MetaRecord::for_user(&meta) {
                if self.meta_pipeline.write(vec![record]).await == StatusCode::Ok {
                    self.user_manager.apply(meta);
                    tracing::info!("root user bootstrapped");
                }
            }
        }
    }

    /// Fold a node's tablet reports into the catalog during restore.
    async fn reconcile_reports(self: &Arc<Self>, addr: &str, reports: &[TabletReport]) {
        for report in reports {
            let meta = &report.meta;
            if meta.table_name == META_TABLE_NAME {
                continue;
            }
            let known = self
                .tablet_manager
                .find_tablet(&meta.table_name, &meta.key_range.start);
            match known {
                Some(tablet) if tablet.key_range() == meta.key_range => {
                    if tablet.set_addr_and_status_if(addr, TabletStatus::Ready, TabletStatus::NotInit)
                    {
                        tablet.mark_loaded();
                        tablet.update_from_report(meta, &report.counter);
                    }
                }
                _ => {
                    // Nothing in meta matches: the node is serving a zombie
                    // (e.g. a half-split parent). Unload it.
                    tracing::warn!(
                        addr,
                        table = %meta.table_name,
                        range = %meta.key_range,
                        "unloading unknown reported tablet"
                    );
                    self.clone().unload_zombie(addr.to_string(), meta.clone());
                }
            }
        }
    }

    // ---- node membership ---------------------------------------------------

    fn register_node(self: &Arc<Self>, addr: &str, uuid: &str) -> TabletNode {
        let node = self.node_manager.add_node(addr, uuid);
        tracing::info!(addr, uuid, "tablet server registered");

        // Watch the registration node: deletion means the server is gone.
        let (tx, mut rx) = mpsc::unbounded_channel::<WatchEvent>();
        let path = format!("{TS_LIST_PATH}/{uuid}");
        let _ = self.coord.check_and_watch_exist(&path, tx);
        let master = self.clone();
        let addr = addr.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.kind == WatchEventKind::Deleted {
                    master.handle_node_down(&addr).await;
                    break;
                }
            }
        });
        node
    }

    pub(crate) async fn handle_node_down(self: &Arc<Self>, addr: &str) {
        if self.node_manager.del_node(addr).is_none() {
            return;
        }
        tracing::warn!(addr, "tablet server down");
        self.router.unregister(addr);
        self.maybe_enter_safe_mode_on_ratio();

        // The meta tablet gets re-placed first; user tablets depend on it.
        let meta_here = self.meta_tablet_addr().as_deref() == Some(addr);
        if meta_here {
            self.meta_pipeline.suspend();
            *self.meta_tablet.lock().unwrap() = None;
            if let Some(table) = self.tablet_manager.find_table(META_TABLE_NAME) {
                for tablet in table.tablets() {
                    table.remove_tablet(&tablet.key_range().start);
                }
                self.tablet_manager.delete_table(META_TABLE_NAME);
            }
            if let Some(node) = self.pick_least_loaded_node() {
                if let Err(err) = self.place_meta_tablet(&node.addr()).await {
                    tracing::error!(error = ?err, "meta tablet re-placement failed");
                }
            }
        }

        // Every tablet attributed to the dead node goes offline and reloads.
        for tablet in self.tablet_manager.tablets_on_server(addr) {
            if tablet.table_name() == META_TABLE_NAME {
                continue;
            }
            let status = tablet.status();
            let offlined = match status {
                TabletStatus::Ready
                | TabletStatus::OnLoad
                | TabletStatus::OnMerge
                | TabletStatus::Unloading
                | TabletStatus::UnLoadFail => tablet.set_status(TabletStatus::Offline),
                TabletStatus::OnSplit | TabletStatus::SplitFail => {
                    tablet.set_status(TabletStatus::Offline)
                }
                _ => false,
            };
            if offlined {
                tablet.set_addr("");
                self.clone().try_load_tablet(tablet, String::new());
            }
        }
    }

    /// Pick the ready node with the fewest tablets.
    pub(crate) fn pick_least_loaded_node(&self) -> Option<TabletNode> {
        self.node_manager
            .ready_nodes()
            .into_iter()
            .min_by_key(|n| (n.tablet_count(), n.addr()))
    }

    // ---- control loop ------------------------------------------------------

    fn spawn_timers(self: Arc<Self>) {
        {
            let master = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(master.config.query_interval);
                loop {
                    ticker.tick().await;
                    if !master.is_running() {
                        break;
                    }
                    master.rescan_registrations().await;
                    master.query_tablet_nodes(false).await;
                }
            });
        }
        {
            let master = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(master.config.balance_interval);
                loop {
                    ticker.tick().await;
                    if !master.is_running() {
                        break;
                    }
                    master.load_balance().await;
                }
            });
        }
        {
            let master = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(master.config.gc_interval);
                loop {
                    ticker.tick().await;
                    if !master.is_running() {
                        break;
                    }
                    master.run_gc_round().await;
                }
            });
        }
        {
            let master = self;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(master.config.availability_interval);
                loop {
                    ticker.tick().await;
                    if !master.is_running() {
                        break;
                    }
                    master.availability_check().await;
                }
            });
        }
    }

    /// Detect registrations created after startup (or missed watches).
    async fn rescan_registrations(self: &Arc<Self>) {
        let Ok(children) = self.coord.list_children(TS_LIST_PATH) else {
            return;
        };
        for (uuid, addr_bytes) in children {
            let addr = String::from_utf8_lossy(&addr_bytes).to_string();
            if self.node_manager.find_node(&addr).is_none() {
                self.register_node(&addr, &uuid);
                self.try_leave_safe_mode_on_ratio();
                // A fresh node can absorb pending tablets right away.
                self.try_move_pending_tablets();
                if self.meta_tablet_addr().is_none() {
                    if let Err(err) = self.place_meta_tablet(&addr).await {
                        tracing::error!(error = ?err, "meta placement on new node failed");
                    } else if let Err(err) = self.load_meta_table().await {
                        tracing::error!(error = ?err, "meta load after placement failed");
                    } else {
                        self.ensure_root_user().await;
                    }
                }
            }
        }
    }

    /// One query round over every registered node.
    pub(crate) async fn query_tablet_nodes(self: &Arc<Self>, is_gc: bool) {
        for node in self.node_manager.nodes() {
            let addr = node.addr();
            let Some(rpc) = self.router.node(&addr) else {
                self.count_query_failure(&node).await;
                continue;
            };
            let response = rpc
                .query(QueryRequest {
                    sequence_id: self.sequence.next(),
                    is_gc,
                })
                .await;
            if response.status != StatusCode::Ok {
                self.count_query_failure(&node).await;
                continue;
            }
            if !node.accept_query(response.sequence_id, &response.stat) {
                tracing::debug!(addr, "discarding stale query response");
                continue;
            }
            for report in &response.tablets {
                if let Some(tablet) = self
                    .tablet_manager
                    .find_tablet(&report.meta.table_name, &report.meta.key_range.start)
                {
                    match tablet.verify_report(&report.meta) {
                        Ok(()) => tablet.update_from_report(&report.meta, &report.counter),
                        Err(code) => {
                            // The node's view diverged from the catalog (e.g.
                            // a half-applied split): re-write our record.
                            tracing::warn!(
                                addr,
                                tablet = %tablet.path(),
                                %code,
                                "divergent tablet report; repairing meta"
                            );
                            if let Ok(record) = tablet.to_meta_record() {
                                let pipeline = self.meta_pipeline.clone();
                                tokio::spawn(async move {
                                    pipeline.repair(record).await;
                                });
                            }
                        }
                    }
                }
            }
            if is_gc {
                self.gc
                    .process_query_report(&response.tablets, &response.inherited);
            }
        }
    }

    async fn count_query_failure(self: &Arc<Self>, node: &TabletNode) {
        let failures = node.record_query_failure();
        if failures >= self.config.kick_after_query_failures
            && node.state() == NodeState::Ready
        {
            tracing::warn!(addr = %node.addr(), failures, "kicking unresponsive node");
            self.try_kick_tablet_node(&node.addr());
        }
    }

    async fn load_balance(self: &Arc<Self>) {
        if !self.config.load_balance_enabled || self.in_safe_mode() {
            return;
        }
        let nodes = self.node_manager.ready_nodes();
        if nodes.len() < 2 {
            return;
        }
        // Size first; QPS pass only when sizes look settled.
        let decisions = {
            let by_size = self.balancer.plan(&self.size_scheduler, &nodes, |addr| {
                self.tablet_manager.tablets_on_server(addr)
            });
            if by_size.is_empty() {
                self.balancer.plan(&self.load_scheduler, &nodes, |addr| {
                    self.tablet_manager.tablets_on_server(addr)
                })
            } else {
                by_size
            }
        };
        for decision in decisions {
            self.clone()
                .try_move_tablet(decision.tablet, decision.target_addr);
        }
    }

    async fn run_gc_round(self: &Arc<Self>) {
        if self.in_safe_mode() {
            return;
        }
        if !self.gc.pre_query() {
            return;
        }
        self.query_tablet_nodes(true).await;
        self.gc.post_query();
    }

    /// Re-drive tablets stuck in Pending/Offline and watch overall health.
    async fn availability_check(self: &Arc<Self>) {
        let ratio = self.tablet_manager.offline_tablet_ratio();
        if ratio > 0.0 {
            tracing::debug!(offline_ratio = ratio, "availability check");
        }
        self.try_move_pending_tablets();
    }

    pub(crate) fn try_move_pending_tablets(self: &Arc<Self>) {
        if self.in_safe_mode() || self.node_manager.ready_node_count() == 0 {
            return;
        }
        for table in self.tablet_manager.user_tables() {
            for tablet in table.tablets() {
                if tablet.status() == TabletStatus::Pending
                    || tablet.status() == TabletStatus::Offline
                {
                    self.clone().try_load_tablet(tablet, String::new());
                }
            }
        }
    }

    // ---- safe mode & kick --------------------------------------------------

    pub fn enter_safe_mode(&self) -> anyhow::Result<()> {
        if self.safe_mode.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::warn!("entering safe mode");
        if self.coord.read_node(SAFEMODE_PATH)?.is_none() {
            self.coord.create_node(SAFEMODE_PATH, b"on", false)?;
        }
        Ok(())
    }

    pub fn leave_safe_mode(self: &Arc<Self>) -> anyhow::Result<()> {
        if !self.safe_mode.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.auto_safe_mode.store(false, Ordering::SeqCst);
        tracing::warn!("leaving safe mode");
        self.coord.delete_node(SAFEMODE_PATH)?;
        self.try_move_pending_tablets();
        Ok(())
    }

    fn maybe_enter_safe_mode_on_ratio(&self) {
        let live = self.node_manager.ready_node_count();
        if live == 0 && !self.in_safe_mode() {
            self.auto_safe_mode.store(true, Ordering::SeqCst);
            let _ = self.enter_safe_mode();
        }
    }

    fn try_leave_safe_mode_on_ratio(self: &Arc<Self>) {
        // Automatic exit only for automatic entry; operator safe mode stays
        // until the operator lifts it.
        if self.auto_safe_mode.load(Ordering::SeqCst)
            && self.in_safe_mode()
            && self.node_manager.ready_node_count() > 0
        {
            let _ = self.leave_safe_mode();
        }
    }

    /// Evict a tablet server through its kick mark. A server too wedged to
    /// honor the mark has its registration deleted after a grace period,
    /// which fires the same down-handling as a session loss.
    pub fn try_kick_tablet_node(self: &Arc<Self>, addr: &str) {
        let Some(node) = self.node_manager.find_node(addr) else {
            return;
        };
        if node.state() == NodeState::OnKick {
            return;
        }
        node.set_state(NodeState::OnKick);
        let path = kick_path_for(&node.uuid());
        if let Err(err) = self.coord.create_node(&path, b"kick", false) {
            tracing::warn!(addr, error = ?err, "kick mark create failed");
        } else {
            tracing::warn!(addr, "kick mark written");
        }

        let master = self.clone();
        let addr = addr.to_string();
        let ts_path = format!("{TS_LIST_PATH}/{}", node.uuid());
        tokio::spawn(async move {
            tokio::time::sleep(master.config.query_interval * 4).await;
            if master.node_manager.find_node(&addr).is_some() {
                tracing::warn!(addr, "kicked node did not exit; forcing eviction");
                let _ = master.coord.delete_node(&ts_path);
            }
        });
    }

    // ---- table operations --------------------------------------------------

    fn check_permission(&self, token: &str) -> Result<(), StatusCode> {
        if self.user_manager.has_permission(token) {
            Ok(())
        } else {
            Err(StatusCode::NotPermission)
        }
    }

    /// Create a table with optional pre-split keys and start loading it.
    pub async fn create_table(
        self: &Arc<Self>,
        token: &str,
        schema: TableSchema,
        split_keys: Vec<Vec<u8>>,
    ) -> Result<(), StatusCode> {
        self.check_permission(token)?;
        if !crate::meta::is_valid_table_name(&schema.name) || schema.name == META_TABLE_NAME {
            return Err(StatusCode::BadParam);
        }
        if self.tablet_manager.find_table(&schema.name).is_some() {
            return Err(StatusCode::TableExist);
        }

        let mut table_meta = TableMeta::new(schema.clone(), crate::unix_time_ms());
        table_meta.status = TableStatus::Enable;

        // Sorted, deduped split points carve the keyspace into tablets.
        let mut bounds = split_keys;
        bounds.retain(|k| !k.is_empty());
        bounds.sort();
        bounds.dedup();
        let mut starts: Vec<Vec<u8>> = vec![Vec::new()];
        starts.extend(bounds);

        let mut tablet_metas = Vec::with_capacity(starts.len());
        for (idx, start) in starts.iter().enumerate() {
            let end = starts.get(idx + 1).cloned().unwrap_or_default();
            let num = table_meta.next_tablet_num;
            table_meta.next_tablet_num += 1;
            tablet_metas.push(TabletMeta {
                table_name: schema.name.clone(),
                path: crate::meta::tablet_path(&schema.name, num),
                key_range: KeyRange::new(start.clone(), end),
                status: TabletStatus::Offline,
                ..Default::default()
            });
        }

        let mut records = vec![MetaRecord::for_table(&table_meta).map_err(|_| StatusCode::BadParam)?];
        for meta in &tablet_metas {
            records.push(MetaRecord::for_tablet(meta).map_err(|_| StatusCode::BadParam)?);
        }
        let status = self.meta_pipeline.write(records).await;
        if status != StatusCode::Ok {
            return Err(status);
        }

        let table = Table::new(table_meta);
        let tablets: Vec<Tablet> = tablet_metas.into_iter().map(Tablet::new).collect();
        for tablet in &tablets {
            table.add_tablet(tablet.clone());
        }
        self.tablet_manager
            .add_table(table)
            .map_err(|_| StatusCode::TableExist)?;
        tracing::info!(table = %schema.name, tablets = tablets.len(), "table created");
        for tablet in tablets {
            self.clone().try_load_tablet(tablet, String::new());
        }
        Ok(())
    }

    pub async fn disable_table(self: &Arc<Self>, token: &str, name: &str) -> Result<(), StatusCode> {
        self.check_permission(token)?;
        let table = self
            .tablet_manager
            .resolve_table(name)
            .ok_or(StatusCode::TableNotFound)?;
        if table.status() != TableStatus::Enable {
            return Err(StatusCode::TableNotEnabled);
        }
        let mut meta = table.meta();
        meta.status = TableStatus::Disable;
        let record = MetaRecord::for_table(&meta).map_err(|_| StatusCode::BadParam)?;
        let status = self.meta_pipeline.write(vec![record]).await;
        if status != StatusCode::Ok {
            return Err(status);
        }
        if !table.set_status(TableStatus::Disable) {
            return Err(StatusCode::InvalidTransition);
        }
        for tablet in table.tablets() {
            self.clone().try_unload_tablet_for_disable(tablet);
        }
        tracing::info!(table = %table.name(), "table disabled");
        Ok(())
    }

    pub async fn enable_table(self: &Arc<Self>, token: &str, name: &str) -> Result<(), StatusCode> {
        self.check_permission(token)?;
        let table = self
            .tablet_manager
            .resolve_table(name)
            .ok_or(StatusCode::TableNotFound)?;
        let mut meta = table.meta();
        meta.status = TableStatus::Enable;
        let record = MetaRecord::for_table(&meta).map_err(|_| StatusCode::BadParam)?;
        let status = self.meta_pipeline.write(vec![record]).await;
        if status != StatusCode::Ok {
            return Err(status);
        }
        if !table.set_status(TableStatus::Enable) {
            return Err(StatusCode::InvalidTransition);
        }
        for tablet in table.tablets() {
            self.clone().try_load_tablet(tablet, String::new());
        }
        tracing::info!(table = %table.name(), "table enabled");
        Ok(())
    }

    /// Asynchronous deletion: table goes Deleting, tablets go Deleted one by
    /// one, and the table record disappears when the last tablet is gone.
    pub async fn drop_table(self: &Arc<Self>, token: &str, name: &str) -> Result<(), StatusCode> {
        self.check_permission(token)?;
        let table = self
            .tablet_manager
            .resolve_table(name)
            .ok_or(StatusCode::TableNotFound)?;
        if table.status() != TableStatus::Disable {
            return Err(StatusCode::TableNotEnabled);
        }
        let mut meta = table.meta();
        meta.status = TableStatus::Deleting;
        let record = MetaRecord::for_table(&meta).map_err(|_| StatusCode::BadParam)?;
        let status = self.meta_pipeline.write(vec![record]).await;
        if status != StatusCode::Ok {
            return Err(status);
        }
        if !table.set_status(TableStatus::Deleting) {
            return Err(StatusCode::InvalidTransition);
        }
        for tablet in table.tablets() {
            self.clone().delete_tablet_async(tablet);
        }
        self.clone().finish_table_removal_when_empty(table);
        Ok(())
    }

    pub async fn rename_table(
        self: &Arc<Self>,
        token: &str,
        name: &str,
        alias: &str,
    ) -> Result<(), StatusCode> {
        self.check_permission(token)?;
        if !crate::meta::is_valid_table_name(alias) {
            return Err(StatusCode::BadParam);
        }
        if self.tablet_manager.resolve_table(alias).is_some() {
            return Err(StatusCode::TableExist);
        }
        let table = self
            .tablet_manager
            .resolve_table(name)
            .ok_or(StatusCode::TableNotFound)?;
        let mut meta = table.meta();
        meta.schema.alias = Some(alias.to_string());
        let record = MetaRecord::for_table(&meta).map_err(|_| StatusCode::BadParam)?;
        let status = self.meta_pipeline.write(vec![record]).await;
        if status != StatusCode::Ok {
            return Err(status);
        }
        table.set_schema(meta.schema);
        tracing::info!(table = %table.name(), alias, "table renamed");
        Ok(())
    }

    /// Schema update. Online mode journals the new schema, broadcasts it to
    /// every serving node, and completes when acked ranges cover ["", "").
    pub async fn update_table(
        self: &Arc<Self>,
        token: &str,
        name: &str,
        new_schema: TableSchema,
    ) -> Result<(), StatusCode> {
        self.check_permission(token)?;
        let table = self
            .tablet_manager
            .resolve_table(name)
            .ok_or(StatusCode::TableNotFound)?;
        let old_schema = table.schema();
        let structural = old_schema.is_structural_change(&new_schema);
        if !self.config.online_schema_update
            && structural
            && table.status() != TableStatus::Disable
        {
            return Err(StatusCode::TableNotEnabled);
        }
        if table.status() == TableStatus::Disable {
            // Disabled tables take the schema directly; no sync needed.
            let mut meta = table.meta();
            meta.schema = new_schema.clone();
            let record = MetaRecord::for_table(&meta).map_err(|_| StatusCode::BadParam)?;
            let status = self.meta_pipeline.write(vec![record]).await;
            if status != StatusCode::Ok {
                return Err(status);
            }
            table.set_schema(new_schema);
            return Ok(());
        }

        if !table.prepare_update(new_schema.clone()) {
            return Err(StatusCode::Busy);
        }
        let mut meta = table.meta();
        meta.schema = new_schema.clone();
        let record = MetaRecord::for_table(&meta).map_err(|_| StatusCode::BadParam)?;
        let status = self.meta_pipeline.write(vec![record]).await;
        if status != StatusCode::Ok {
            table.abort_update();
            return Err(status);
        }

        // Broadcast per node; each ack covers the node's tablets of this table.
        let table_name = table.name();
        let mut complete = false;
        for addr in self.node_manager.node_addrs() {
            let Some(rpc) = self.router.node(&addr) else {
                continue;
            };
            let response = rpc
                .update_schema(UpdateSchemaRequest {
                    sequence_id: self.sequence.next(),
                    table_name: table_name.clone(),
                    schema: new_schema.clone(),
                })
                .await;
            if response.status != StatusCode::Ok {
                continue;
            }
            for range in &response.acked_ranges {
                if table.add_synced_range(range) {
                    complete = true;
                }
            }
        }
        if complete {
            table.commit_update();
            tracing::info!(table = %table_name, "schema update synced to all tablets");
            Ok(())
        } else {
            // Remaining tablets pick the schema up when they next load; the
            // sync flag stays up so updatecheck reports the truth.
            tracing::warn!(table = %table_name, "schema update incomplete; sync pending");
            Ok(())
        }
    }

    /// Whether an online schema update has fully propagated.
    pub fn update_check(&self, name: &str) -> Result<bool, StatusCode> {
        let table = self
            .tablet_manager
            .resolve_table(name)
            .ok_or(StatusCode::TableNotFound)?;
        Ok(!table.schema_is_syncing())
    }

    // ---- snapshots ---------------------------------------------------------

    /// Take a table snapshot: every tablet reports a snapshot point and the
    /// whole set is journaled in one batched meta write.
    pub async fn snapshot_table(
        self: &Arc<Self>,
        token: &str,
        name: &str,
    ) -> Result<u64, StatusCode> {
        self.check_permission(token)?;
        let table = self
            .tablet_manager
            .resolve_table(name)
            .ok_or(StatusCode::TableNotFound)?;
        if table.status() != TableStatus::Enable {
            return Err(StatusCode::TableNotEnabled);
        }
        let tablets = table.tablets();
        let mut points = Vec::with_capacity(tablets.len());
        for tablet in &tablets {
            let addr = tablet.server_addr();
            let Some(rpc) = self.router.node(&addr) else {
                return Err(StatusCode::ServerUnavailable);
            };
            let response = rpc
                .snapshot_tablet(crate::rpc::SnapshotTabletRequest {
                    sequence_id: self.sequence.next(),
                    table_name: table.name(),
                    key_start: tablet.key_range().start,
                })
                .await;
            if response.status != StatusCode::Ok {
                return Err(response.status);
            }
            points.push(response.snapshot_point);
        }
        // The snapshot id is the maximum point; per-tablet fences are below it.
        let snapshot_id = points.iter().copied().max().unwrap_or(0);

        let mut table_meta = table.meta();
        table_meta.snapshots.push(snapshot_id);
        let mut records = vec![MetaRecord::for_table(&table_meta).map_err(|_| StatusCode::BadParam)?];
        for tablet in &tablets {
            let mut meta = tablet.meta();
            meta.snapshots.push(snapshot_id);
            records.push(MetaRecord::for_tablet(&meta).map_err(|_| StatusCode::BadParam)?);
        }
        let status = self.meta_pipeline.write(records).await;
        if status != StatusCode::Ok {
            return Err(status);
        }
        for tablet in &tablets {
            tablet.add_snapshot(snapshot_id);
        }
        table.add_snapshot(snapshot_id);
        tracing::info!(table = %table.name(), snapshot_id, "snapshot taken");
        Ok(snapshot_id)
    }

    pub async fn del_snapshot(
        self: &Arc<Self>,
        token: &str,
        name: &str,
        snapshot_id: u64,
    ) -> Result<(), StatusCode> {
        self.check_permission(token)?;
        let table = self
            .tablet_manager
            .resolve_table(name)
            .ok_or(StatusCode::TableNotFound)?;
        let tablets = table.tablets();
        if !tablets.iter().any(|t| t.snapshots().contains(&snapshot_id)) {
            return Err(StatusCode::SnapshotNotExist);
        }
        let mut table_meta = table.meta();
        table_meta.snapshots.retain(|&s| s != snapshot_id);
        let mut records = vec![MetaRecord::for_table(&table_meta).map_err(|_| StatusCode::BadParam)?];
        for tablet in &tablets {
            let mut meta = tablet.meta();
            meta.snapshots.retain(|&s| s != snapshot_id);
            records.push(MetaRecord::for_tablet(&meta).map_err(|_| StatusCode::BadParam)?);
        }
        let status = self.meta_pipeline.write(records).await;
        if status != StatusCode::Ok {
            return Err(status);
        }
        for tablet in &tablets {
            tablet.del_snapshot(snapshot_id);
        }
        table.del_snapshot(snapshot_id);
        tracing::info!(table = %table.name(), snapshot_id, "snapshot deleted");
        Ok(())
    }

    /// Roll the table back to a snapshot: every tablet's read fence drops to
    /// the snapshot point.
    pub async fn rollback_table(
        self: &Arc<Self>,
        token: &str,
        name: &str,
        snapshot_id: u64,
        rollback_name: &str,
    ) -> Result<(), StatusCode> {
        self.check_permission(token)?;
        let table = self
            .tablet_manager
            .resolve_table(name)
            .ok_or(StatusCode::TableNotFound)?;
        let tablets = table.tablets();
        if !tablets.iter().any(|t| t.snapshots().contains(&snapshot_id)) {
            return Err(StatusCode::SnapshotNotExist);
        }
        let mut rollbacks = Vec::with_capacity(tablets.len());
        for tablet in &tablets {
            let addr = tablet.server_addr();
            let Some(rpc) = self.router.node(&addr) else {
                return Err(StatusCode::ServerUnavailable);
            };
            let response = rpc
                .rollback_tablet(crate::rpc::RollbackTabletRequest {
                    sequence_id: self.sequence.next(),
                    table_name: table.name(),
                    key_start: tablet.key_range().start,
                    snapshot_id,
                })
                .await;
            if response.status != StatusCode::Ok {
                return Err(response.status);
            }
            rollbacks.push(crate::meta::Rollback {
                name: rollback_name.to_string(),
                snapshot_id,
                rollback_point: response.rollback_point,
            });
        }
        let mut records = Vec::with_capacity(tablets.len());
        for (tablet, rollback) in tablets.iter().zip(&rollbacks) {
            let mut meta = tablet.meta();
            meta.rollbacks.push(rollback.clone());
            records.push(MetaRecord::for_tablet(&meta).map_err(|_| StatusCode::BadParam)?);
        }
        let status = self.meta_pipeline.write(records).await;
        if status != StatusCode::Ok {
            return Err(status);
        }
        for (tablet, rollback) in tablets.iter().zip(rollbacks) {
            tablet.add_rollback(rollback);
        }
        tracing::info!(table = %table.name(), snapshot_id, "table rolled back");
        Ok(())
    }

    // ---- user operations ---------------------------------------------------

    pub async fn create_user(
        self: &Arc<Self>,
        token: &str,
        name: &str,
        password: &str,
    ) -> Result<(), StatusCode> {
        if !self.user_manager.is_root_token(token) {
            return Err(StatusCode::NotPermission);
        }
        let meta = self.user_manager.prepare_create(name, password)?;
        self.commit_user_record(meta).await
    }

    pub async fn delete_user(self: &Arc<Self>, token: &str, name: &str) -> Result<(), StatusCode> {
        if !self.user_manager.is_root_token(token) {
            return Err(StatusCode::NotPermission);
        }
        if name == ROOT_USER {
            return Err(StatusCode::BadParam);
        }
        if !self.user_manager.is_known(name) {
            return Err(StatusCode::NotFound);
        }
        let record = MetaRecord::delete(meta_codec::encode_user_key(name));
        let status = self.meta_pipeline.write(vec![record]).await;
        if status != StatusCode::Ok {
            return Err(status);
        }
        self.user_manager.remove(name);
        Ok(())
    }

    pub async fn change_password(
        self: &Arc<Self>,
        token: &str,
        name: &str,
        password: &str,
    ) -> Result<(), StatusCode> {
        let is_self = self
            .user_manager
            .get(name)
            .is_some_and(|meta| meta.token == token);
        if !is_self && !self.user_manager.is_root_token(token) {
            return Err(StatusCode::NotPermission);
        }
        let meta = self.user_manager.prepare_change_pwd(name, password)?;
        self.commit_user_record(meta).await
    }

    pub async fn add_user_to_group(
        self: &Arc<Self>,
        token: &str,
        name: &str,
        group: &str,
    ) -> Result<(), StatusCode> {
        if !self.user_manager.is_root_token(token) {
            return Err(StatusCode::NotPermission);
        }
        let meta = self.user_manager.prepare_add_to_group(name, group)?;
        self.commit_user_record(meta).await
    }

    pub async fn remove_user_from_group(
        self: &Arc<Self>,
        token: &str,
        name: &str,
        group: &str,
    ) -> Result<(), StatusCode> {
        if !self.user_manager.is_root_token(token) {
            return Err(StatusCode::NotPermission);
        }
        let meta = self.user_manager.prepare_remove_from_group(name, group)?;
        self.commit_user_record(meta).await
    }

    pub fn show_users(&self) -> Vec<UserMeta> {
        self.user_manager.list()
    }

    async fn commit_user_record(self: &Arc<Self>, meta: UserMeta) -> Result<(), StatusCode> {
        let record = MetaRecord::for_user(&meta).map_err(|_| StatusCode::BadParam)?;
        let status = self.meta_pipeline.write(vec![record]).await;
        if status != StatusCode::Ok {
            return Err(status);
        }
        self.user_manager.apply(meta);
        Ok(())
    }

    // ---- introspection -----------------------------------------------------

    pub fn show_tables(&self) -> Vec<(TableMeta, Vec<TabletMeta>)> {
        self.tablet_manager
            .all_tables()
            .into_iter()
            .map(|table| {
                let tablets = table.tablets().iter().map(|t| t.meta()).collect();
                (table.meta(), tablets)
            })
            .collect()
    }

    pub fn show_tablet_nodes(&self) -> Vec<(String, crate::rpc::NodeStat, bool)> {
        self.node_manager
            .nodes()
            .into_iter()
            .map(|node| {
                (
                    node.addr(),
                    node.stat(),
                    node.state() == NodeState::Ready,
                )
            })
            .collect()
    }
}
