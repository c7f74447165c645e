//! Strata: a range-partitioned, sorted key-value table service.
//!
//! User tables are split into tablets (contiguous key ranges) served by a
//! fleet of tablet servers; a master coordinates table lifecycle, placement,
//! splitting/merging, balancing, schema changes, and file garbage
//! collection. The catalog lives in-band, in a reserved meta table whose
//! serving address is published through a coordination service. Clients
//! resolve routes through a cached three-level lookup and talk to tablet
//! servers directly.

pub mod balancer;
pub mod client;
pub mod cluster;
pub mod cookie;
pub mod coordination;
#[cfg(test)]
pub mod fake_node;
pub mod fragment;
pub mod gc;
pub mod lifecycle;
pub mod master;
pub mod meta;
pub mod meta_cache;
pub mod meta_codec;
pub mod meta_pipeline;
pub mod node_manager;
pub mod rpc;
pub mod status;
pub mod tablet_io;
pub mod tablet_manager;
pub mod tabletnode;
pub mod user_manager;

pub use client::{Client, ClientConfig};
pub use cluster::{ClusterOptions, EmbeddedCluster};
pub use master::{MasterConfig, MasterImpl};
pub use status::StatusCode;
pub use tabletnode::{TabletNodeConfig, TabletNodeImpl};

/// Wall-clock milliseconds since the unix epoch, clamped to u64.
pub fn unix_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
