//! Live tablet-server registry and per-node health/load bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::meta::TabletCounter;
use crate::rpc::NodeStat;

/// Master's view of one tablet server's availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Ready,
    /// Registration gone; tablets pending recovery.
    Offline,
    /// Kick mark written; awaiting self-exit.
    OnKick,
}

struct NodeInner {
    addr: String,
    /// Coordination registration node name (`<session>#<seq>`).
    uuid: String,
    state: NodeState,
    stat: NodeStat,
    average: TabletCounter,
    query_fail_count: u32,
    /// Highest sequence id seen in a query response; older replies dropped.
    last_query_seq: u64,
}

/// Shared handle to one registered node.
#[derive(Clone)]
pub struct TabletNode {
    inner: Arc<Mutex<NodeInner>>,
}

impl TabletNode {
    fn new(addr: &str, uuid: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NodeInner {
                addr: addr.to_string(),
                uuid: uuid.to_string(),
                state: NodeState::Ready,
                stat: NodeStat::default(),
                average: TabletCounter::default(),
                query_fail_count: 0,
                last_query_seq: 0,
            })),
        }
    }

    pub fn addr(&self) -> String {
        self.inner.lock().unwrap().addr.clone()
    }

    pub fn uuid(&self) -> String {
        self.inner.lock().unwrap().uuid.clone()
    }

    pub fn state(&self) -> NodeState {
        self.inner.lock().unwrap().state
    }

    pub fn set_state(&self, state: NodeState) {
        self.inner.lock().unwrap().state = state;
    }

    pub fn stat(&self) -> NodeStat {
        self.inner.lock().unwrap().stat.clone()
    }

    pub fn data_size(&self) -> u64 {
        self.inner.lock().unwrap().stat.data_size
    }

    pub fn load_weight(&self) -> u64 {
        self.inner.lock().unwrap().stat.load_weight
    }

    pub fn tablet_count(&self) -> u64 {
        self.inner.lock().unwrap().stat.tablet_count
    }

    /// Accept a query response if it is not older than what we already saw.
    /// Returns false for a stale reply, which the caller must discard.
    pub fn accept_query(&self, sequence_id: u64, stat: &NodeStat) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if sequence_id < inner.last_query_seq {
            return false;
        }
        inner.last_query_seq = sequence_id;
        inner.stat = stat.clone();
        inner.query_fail_count = 0;
        inner.average = TabletCounter {
            write_qps: crate::tablet_manager::counter_weighted_sum(
                inner.average.write_qps,
                stat.load_weight,
            ),
            ..inner.average
        };
        true
    }

    /// Count one failed query round; returns the new consecutive count.
    pub fn record_query_failure(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.query_fail_count += 1;
        inner.query_fail_count
    }
}

/// Registry of live tablet servers, keyed by serving address.
#[derive(Default)]
pub struct TabletNodeManager {
    nodes: Mutex<HashMap<String, TabletNode>>,
}

impl TabletNodeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, addr: &str, uuid: &str) -> TabletNode {
        let node = TabletNode::new(addr, uuid);
        self.nodes
            .lock()
            .unwrap()
            .insert(addr.to_string(), node.clone());
        node
    }

    pub fn del_node(&self, addr: &str) -> Option<TabletNode> {
        self.nodes.lock().unwrap().remove(addr)
    }

    pub fn find_node(&self, addr: &str) -> Option<TabletNode> {
        self.nodes.lock().unwrap().get(addr).cloned()
    }

    pub fn node_addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.nodes.lock().unwrap().keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub fn nodes(&self) -> Vec<TabletNode> {
        let mut nodes: Vec<TabletNode> = self.nodes.lock().unwrap().values().cloned().collect();
        nodes.sort_by_key(|n| n.addr());
        nodes
    }

    pub fn ready_nodes(&self) -> Vec<TabletNode> {
        self.nodes()
            .into_iter()
            .filter(|n| n.state() == NodeState::Ready)
            .collect()
    }

    pub fn ready_node_count(&self) -> usize {
        self.ready_nodes().len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_query_responses_are_rejected() {
        let manager = TabletNodeManager::new();
        let node = manager.add_node("ts1:7777", "0001#0000000001");
        let newer = NodeStat {
            tablet_count: 5,
            data_size: 100,
            load_weight: 10,
        };
        assert!(node.accept_query(7, &newer));
        let stale = NodeStat {
            tablet_count: 1,
            ..Default::default()
        };
        assert!(!node.accept_query(3, &stale));
        assert_eq!(node.tablet_count(), 5);
    }

    #[test]
    fn ready_filter_excludes_kicked_nodes() {
        let manager = TabletNodeManager::new();
        manager.add_node("ts1:7777", "a#1");
        let kicked = manager.add_node("ts2:7777", "b#2");
        kicked.set_state(NodeState::OnKick);
        let ready = manager.ready_nodes();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].addr(), "ts1:7777");
    }
}
