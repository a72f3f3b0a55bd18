//! Durable per-host facts: whether a host is enabled, the states it was
//! recorded in, and how it was last observed.

use std::collections::HashMap;

use wattgrid_core::{Node, NodeInfo, NodeState};

/// Backing store for host enable flags and state history.
pub trait HostRegistry: Send {
    /// Known hosts and their enable flags, in registration order.
    fn hosts(&self) -> Vec<(String, bool)>;

    fn enable_host(&mut self, name: &str, enabled: bool);

    /// Record a node after it changed. Unknown hosts are registered as
    /// enabled.
    fn store_node(&mut self, node: &Node);

    /// Most recent recorded state of `name` that differs from `current`.
    fn last_differing_state(&self, name: &str, current: NodeState) -> Option<NodeState>;

    /// Last stored observation of `name`, used to seed hosts the platform
    /// does not report.
    fn last_info(&self, name: &str) -> Option<NodeInfo>;
}

/// Only the last two distinct states are kept; that is all
/// `last_differing_state` can ever need.
#[derive(Debug)]
struct HostRecord {
    enabled: bool,
    last: Option<NodeState>,
    previous: Option<NodeState>,
    info: Option<NodeInfo>,
}

impl HostRecord {
    fn push(&mut self, state: NodeState) {
        if self.last != Some(state) {
            self.previous = self.last.replace(state);
        }
    }
}

/// In-process registry; forgets everything on restart.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    order: Vec<String>,
    hosts: HashMap<String, HostRecord>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, name: &str) -> &mut HostRecord {
        if !self.hosts.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.hosts.entry(name.to_string()).or_insert_with(|| HostRecord {
            enabled: true,
            last: None,
            previous: None,
            info: None,
        })
    }
}

impl HostRegistry for MemoryRegistry {
    fn hosts(&self) -> Vec<(String, bool)> {
        self.order
            .iter()
            .filter_map(|n| self.hosts.get(n).map(|h| (n.clone(), h.enabled)))
            .collect()
    }

    fn enable_host(&mut self, name: &str, enabled: bool) {
        self.record(name).enabled = enabled;
    }

    fn store_node(&mut self, node: &Node) {
        let record = self.record(&node.name);
        record.push(node.state());
        // An unknown node carries no observation worth keeping.
        if node.state() != NodeState::Unknown {
            record.info = Some(node.info());
        }
    }

    fn last_differing_state(&self, name: &str, current: NodeState) -> Option<NodeState> {
        let record = self.hosts.get(name)?;
        [record.last, record.previous].into_iter().flatten().find(|s| *s != current)
    }

    fn last_info(&self, name: &str) -> Option<NodeInfo> {
        self.hosts.get(name)?.info.clone()
    }
}
