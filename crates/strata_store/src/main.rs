//! `strata-node`: run a single-process cluster (master + N tablet servers)
//! over a shared data directory.
//!
//! The wire transport is intentionally out of scope; this binary hosts the
//! whole control plane in one process, which is also the deployment the
//! admin CLI drives.

use std::path::PathBuf;

use clap::Parser;

use strata_store::master::GcKind;
use strata_store::{ClusterOptions, EmbeddedCluster};

#[derive(Parser, Debug)]
#[command(name = "strata-node", about = "Strata single-process cluster node")]
struct NodeArgs {
    /// Data directory shared by the master and every tablet server.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Number of tablet servers to host.
    #[arg(long, default_value_t = 2)]
    nodes: usize,

    /// GC strategy: "batch" or "incremental".
    #[arg(long, default_value = "incremental")]
    gc_strategy: String,

    /// Disable the load balancer (placement still happens on load).
    #[arg(long, default_value_t = false)]
    no_balance: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = NodeArgs::parse();
    let mut options = ClusterOptions::new(&args.data_dir).with_nodes(args.nodes);
    options.master.gc_strategy = match args.gc_strategy.as_str() {
        "batch" => GcKind::Batch,
        "incremental" => GcKind::Incremental,
        other => anyhow::bail!("unknown gc strategy: {other}"),
    };
    options.master.load_balance_enabled = !args.no_balance;

    let cluster = EmbeddedCluster::start(options).await?;
    tracing::info!(
        nodes = ?cluster.node_addrs(),
        data_dir = %args.data_dir.display(),
        "cluster running; ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
