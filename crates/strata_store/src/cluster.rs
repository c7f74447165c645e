//! Single-process cluster: master plus N tablet servers over one in-memory
//! coordination registry.
//!
//! This is the deployment used by the CLI, the server binary's local mode,
//! and the integration tests. Durability comes from the shared data
//! directory: the meta tablet is an ordinary fjall keyspace, so a fresh
//! embedded cluster over an existing directory restores every table.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{Client, ClientConfig};
use crate::coordination::MemoryRegistry;
use crate::master::{MasterConfig, MasterImpl};
use crate::meta::TabletStatus;
use crate::rpc::RpcRouter;
use crate::tabletnode::{TabletNodeConfig, TabletNodeImpl};

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub data_dir: PathBuf,
    pub node_count: usize,
    pub master: MasterConfig,
    pub client: ClientConfig,
}

impl ClusterOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let master = MasterConfig {
            root_dir: data_dir.clone(),
            ..Default::default()
        };
        Self {
            data_dir,
            node_count: 1,
            master,
            client: ClientConfig::default(),
        }
    }

    pub fn with_nodes(mut self, node_count: usize) -> Self {
        self.node_count = node_count.max(1);
        self
    }
}

pub struct EmbeddedCluster {
    options: ClusterOptions,
    registry: MemoryRegistry,
    router: RpcRouter,
    master: Arc<MasterImpl>,
    nodes: Vec<Arc<TabletNodeImpl>>,
}

impl EmbeddedCluster {
    /// Boot tablet servers first (so the master's census sees them), then
    /// the master.
    pub async fn start(options: ClusterOptions) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&options.data_dir)?;
        let registry = MemoryRegistry::new();
        let router = RpcRouter::new();

        let mut nodes = Vec::with_capacity(options.node_count);
        for idx in 0..options.node_count {
            let addr = format!("ts{idx}:7710");
            let config = TabletNodeConfig::new(&addr, &options.data_dir);
            let node = TabletNodeImpl::start(config, Arc::new(registry.session()), &router)?;
            nodes.push(node);
        }

        let master = MasterImpl::start(
            options.master.clone(),
            Arc::new(registry.session()),
            router.clone(),
        )
        .await?;

        Ok(Self {
            options,
            registry,
            router,
            master,
            nodes,
        })
    }

    pub fn master(&self) -> &Arc<MasterImpl> {
        &self.master
    }

    pub fn registry(&self) -> &MemoryRegistry {
        &self.registry
    }

    pub fn router(&self) -> &RpcRouter {
        &self.router
    }

    pub fn node_addrs(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.addr().to_string()).collect()
    }

    pub fn client(&self) -> Client {
        Client::new(
            Arc::new(self.registry.session()),
            self.router.clone(),
            self.options.client.clone(),
        )
    }

    /// Add one more tablet server to the running cluster.
    pub fn add_node(&mut self) -> anyhow::Result<String> {
        let addr = format!("ts{}:7710", self.nodes.len());
        let config = TabletNodeConfig::new(&addr, &self.options.data_dir);
        let node = TabletNodeImpl::start(config, Arc::new(self.registry.session()), &self.router)?;
        self.nodes.push(node);
        Ok(addr)
    }

    /// Hard-stop a node, as if its process died (session expires).
    pub fn crash_node(&mut self, addr: &str) {
        self.nodes.retain(|node| {
            if node.addr() == addr {
                node.shutdown(&self.router);
                false
            } else {
                true
            }
        });
        // Dropping the node's session handle happens when the Arc dies; the
        // registry reaps its ephemerals on the shutdown path via the watch.
    }

    /// Block until every tablet of `table` is Ready (or the deadline hits).
    pub async fn wait_table_ready(&self, table: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let ready = self
                .master
                .tablet_manager()
                .find_table(table)
                .map(|t| {
                    let tablets = t.tablets();
                    !tablets.is_empty()
                        && tablets.iter().all(|x| x.status() == TabletStatus::Ready)
                })
                .unwrap_or(false);
            if ready {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Block until `table` has at least `count` tablets, all Ready.
    pub async fn wait_tablet_count(&self, table: &str, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let done = self
                .master
                .tablet_manager()
                .find_table(table)
                .map(|t| {
                    let tablets = t.tablets();
                    tablets.len() >= count
                        && tablets.iter().all(|x| x.status() == TabletStatus::Ready)
                })
                .unwrap_or(false);
            if done {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
