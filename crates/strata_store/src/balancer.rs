//! Per-round tablet placement balancing with pluggable schedulers.
//!
//! The balancer only plans: it inspects node/tablet snapshots and returns
//! bounded move decisions. Execution (unload + load elsewhere) belongs to the
//! lifecycle engine, keeping every decision testable without RPC.

use std::time::Duration;

use crate::node_manager::TabletNode;
use crate::rpc::META_TABLE_NAME;
use crate::tablet_manager::Tablet;
use crate::meta::TabletStatus;

/// Placement policy seam. `need_move` gates a node, `pick_move_out` chooses
/// the tablet to shed, `pick_move_in` chooses the receiver.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;
    fn need_move(&self, node: &TabletNode, all_nodes: &[TabletNode]) -> bool;
    fn pick_move_out(&self, node: &TabletNode, tablets: &[Tablet]) -> Option<Tablet>;
    fn pick_move_in(&self, tablet: &Tablet, all_nodes: &[TabletNode]) -> Option<TabletNode>;
}

/// Balance total on-disk data size across nodes.
pub struct SizeScheduler {
    /// A node needs shedding when its size exceeds mean * (1 + slack%).
    pub slack_percent: u64,
}

impl Default for SizeScheduler {
    fn default() -> Self {
        Self { slack_percent: 20 }
    }
}

fn mean(values: impl Iterator<Item = u64>) -> u64 {
    let (mut sum, mut count) = (0u64, 0u64);
    for value in values {
        sum += value;
        count += 1;
    }
    if count == 0 {
        0
    } else {
        sum / count
    }
}

impl Scheduler for SizeScheduler {
    fn name(&self) -> &'static str {
        "size"
    }

    fn need_move(&self, node: &TabletNode, all_nodes: &[TabletNode]) -> bool {
        if all_nodes.len() < 2 {
            return false;
        }
        let avg = mean(all_nodes.iter().map(|n| n.data_size()));
        node.data_size() > avg + avg * self.slack_percent / 100
    }

    fn pick_move_out(&self, _node: &TabletNode, tablets: &[Tablet]) -> Option<Tablet> {
        tablets.iter().max_by_key(|t| t.data_size()).cloned()
    }

    fn pick_move_in(&self, tablet: &Tablet, all_nodes: &[TabletNode]) -> Option<TabletNode> {
        let source = tablet.server_addr();
        all_nodes
            .iter()
            .filter(|n| n.addr() != source)
            .min_by_key(|n| n.data_size())
            .cloned()
    }
}

/// Balance aggregate QPS across nodes.
pub struct LoadScheduler {
    pub slack_percent: u64,
    /// Nodes under this absolute load are never considered overloaded.
    pub min_load: u64,
}

impl Default for LoadScheduler {
    fn default() -> Self {
        Self {
            slack_percent: 30,
            min_load: 100,
        }
    }
}

impl Scheduler for LoadScheduler {
    fn name(&self) -> &'static str {
        "load"
    }

    fn need_move(&self, node: &TabletNode, all_nodes: &[TabletNode]) -> bool {
        if all_nodes.len() < 2 || node.load_weight() < self.min_load {
            return false;
        }
        let avg = mean(all_nodes.iter().map(|n| n.load_weight()));
        node.load_weight() > avg + avg * self.slack_percent / 100
    }

    fn pick_move_out(&self, _node: &TabletNode, tablets: &[Tablet]) -> Option<Tablet> {
        tablets
            .iter()
            .max_by_key(|t| t.average_counter().load_weight())
            .cloned()
    }

    fn pick_move_in(&self, tablet: &Tablet, all_nodes: &[TabletNode]) -> Option<TabletNode> {
        let source = tablet.server_addr();
        all_nodes
            .iter()
            .filter(|n| n.addr() != source)
            .min_by_key(|n| n.load_weight())
            .cloned()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BalancerConfig {
    /// Cap on moves planned per balancing tick.
    pub max_move_num: usize,
    /// Cap on passes over the node list per tick.
    pub max_round_num: usize,
    /// Tablets loaded more recently than this are left alone.
    pub move_cooldown: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            max_move_num: 1,
            max_round_num: 10,
            move_cooldown: Duration::from_secs(60),
        }
    }
}

/// One planned move: tablet plus receiving address.
#[derive(Debug, Clone)]
pub struct MoveDecision {
    pub tablet: Tablet,
    pub target_addr: String,
}

pub struct LoadBalancer {
    config: BalancerConfig,
}

impl LoadBalancer {
    pub fn new(config: BalancerConfig) -> Self {
        Self { config }
    }

    /// Plan up to `max_move_num` moves using `scheduler` over the given node
    /// snapshots. `tablets_of` yields the tablets currently on one node.
    pub fn plan(
        &self,
        scheduler: &dyn Scheduler,
        nodes: &[TabletNode],
        tablets_of: impl Fn(&str) -> Vec<Tablet>,
    ) -> Vec<MoveDecision> {
        let mut decisions: Vec<MoveDecision> = Vec::new();
        let now = crate::unix_time_ms();
        let cooldown_ms = self.config.move_cooldown.as_millis() as u64;

        for _round in 0..self.config.max_round_num {
            let before = decisions.len();
            for node in nodes {
                if decisions.len() >= self.config.max_move_num {
                    return decisions;
                }
                if !scheduler.need_move(node, nodes) {
                    continue;
                }
                let addr = node.addr();
                let movable: Vec<Tablet> = tablets_of(&addr)
                    .into_iter()
                    .filter(|t| t.status() == TabletStatus::Ready)
                    .filter(|t| t.table_name() != META_TABLE_NAME)
                    .filter(|t| now.saturating_sub(t.load_time_ms()) >= cooldown_ms)
                    .filter(|t| {
                        !decisions
                            .iter()
                            .any(|d| d.tablet.path() == t.path())
                    })
                    .collect();
                let Some(tablet) = scheduler.pick_move_out(node, &movable) else {
                    continue;
                };
                let Some(target) = scheduler.pick_move_in(&tablet, nodes) else {
                    continue;
                };
                tracing::info!(
                    scheduler = scheduler.name(),
                    tablet = %tablet.path(),
                    from = %addr,
                    to = %target.addr(),
                    "balancer planned move"
                );
                decisions.push(MoveDecision {
                    tablet,
                    target_addr: target.addr(),
                });
            }
            if decisions.len() == before {
                break;
            }
        }
        decisions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{KeyRange, TabletMeta};
    use crate::node_manager::TabletNodeManager;
    use crate::rpc::NodeStat;

    fn ready_tablet(table: &str, num: u64, addr: &str, size: u64) -> Tablet {
        let tablet = Tablet::new(TabletMeta {
            table_name: table.to_string(),
            path: crate::meta::tablet_path(table, num),
            key_range: KeyRange::whole(),
            server_addr: addr.to_string(),
            status: TabletStatus::NotInit,
            data_size: size,
            ..Default::default()
        });
        assert!(tablet.set_status(TabletStatus::Ready));
        tablet
    }

    #[test]
    fn size_scheduler_moves_from_heavy_to_light() {
        let nodes = TabletNodeManager::new();
        let heavy = nodes.add_node("heavy:1", "a#1");
        let light = nodes.add_node("light:1", "b#2");
        heavy.accept_query(
            1,
            &NodeStat {
                tablet_count: 2,
                data_size: 10_000,
                load_weight: 0,
            },
        );
        light.accept_query(
            1,
            &NodeStat {
                tablet_count: 0,
                data_size: 100,
                load_weight: 0,
            },
        );

        let big = ready_tablet("t", 1, "heavy:1", 8_000);
        let small = ready_tablet("t", 2, "heavy:1", 2_000);
        let balancer = LoadBalancer::new(BalancerConfig {
            move_cooldown: Duration::ZERO,
            ..Default::default()
        });
        let decisions = balancer.plan(&SizeScheduler::default(), &nodes.nodes(), |addr| {
            if addr == "heavy:1" {
                vec![big.clone(), small.clone()]
            } else {
                Vec::new()
            }
        });
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].tablet.path(), big.path());
        assert_eq!(decisions[0].target_addr, "light:1");
    }

    #[test]
    fn balanced_cluster_plans_nothing() {
        let nodes = TabletNodeManager::new();
        for (idx, addr) in ["a:1", "b:1"].iter().enumerate() {
            let node = nodes.add_node(addr, &format!("s#{idx}"));
            node.accept_query(
                1,
                &NodeStat {
                    tablet_count: 1,
                    data_size: 5_000,
                    load_weight: 50,
                },
            );
        }
        let balancer = LoadBalancer::new(BalancerConfig::default());
        let decisions = balancer.plan(&SizeScheduler::default(), &nodes.nodes(), |_| Vec::new());
        assert!(decisions.is_empty());
    }

    #[test]
    fn recently_moved_tablets_are_excluded() {
        let nodes = TabletNodeManager::new();
        let heavy = nodes.add_node("heavy:1", "a#1");
        nodes.add_node("light:1", "b#2");
        heavy.accept_query(
            1,
            &NodeStat {
                tablet_count: 1,
                data_size: 10_000,
                load_weight: 0,
            },
        );

        let tablet = ready_tablet("t", 1, "heavy:1", 10_000);
        tablet.mark_loaded();
        let balancer = LoadBalancer::new(BalancerConfig::default());
        let decisions = balancer.plan(&SizeScheduler::default(), &nodes.nodes(), |addr| {
            if addr == "heavy:1" {
                vec![tablet.clone()]
            } else {
                Vec::new()
            }
        });
        assert!(decisions.is_empty());
    }
}
