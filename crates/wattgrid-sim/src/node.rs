//! Simulated machines and their power switches.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};
use wattgrid_core::{NodeInfo, NodeState};

use crate::error::{SimError, SimResult};

/// What the hardware is actually doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Power {
    On,
    Off,
    PoweringOn,
    PoweringOff,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimNode {
    pub name: String,
    pub cores_total: f64,
    pub cores_free: f64,
    pub memory_total: f64,
    pub memory_free: f64,
    pub power: Power,
    pub power_on_delay: u64,
    pub power_off_delay: u64,
    /// Upcoming power-on attempts that end with the node still off.
    pub failing_power_ons: u32,
    settles_at: Option<u64>,
}

impl SimNode {
    /// A powered-off node with the given capacity.
    pub fn new(name: impl Into<String>, cores: f64, memory: f64) -> Self {
        Self {
            name: name.into(),
            cores_total: cores,
            cores_free: cores,
            memory_total: memory,
            memory_free: memory,
            power: Power::Off,
            power_on_delay: 5,
            power_off_delay: 5,
            failing_power_ons: 0,
            settles_at: None,
        }
    }

    pub fn with_delays(mut self, power_on: u64, power_off: u64) -> Self {
        self.power_on_delay = power_on;
        self.power_off_delay = power_off;
        self
    }

    pub fn with_failing_power_ons(mut self, count: u32) -> Self {
        self.failing_power_ons = count;
        self
    }

    pub fn powered_on(mut self) -> Self {
        self.power = Power::On;
        self
    }

    pub fn is_busy(&self) -> bool {
        self.cores_free != self.cores_total || self.memory_free != self.memory_total
    }

    pub fn fits(&self, cores: f64, memory: f64) -> bool {
        self.power == Power::On && self.cores_free >= cores && self.memory_free >= memory
    }

    pub fn assign(&mut self, cores: f64, memory: f64) {
        self.cores_free -= cores;
        self.memory_free -= memory;
    }

    pub fn release(&mut self, cores: f64, memory: f64) {
        self.cores_free += cores;
        self.memory_free += memory;
    }

    /// Start a power-on. Returns `Ok(false)` when the node is already on.
    pub fn power_on(&mut self, now: u64) -> SimResult<bool> {
        match self.power {
            Power::PoweringOff => Err(SimError::PoweringOff(self.name.clone())),
            Power::On | Power::PoweringOn => Ok(false),
            Power::Off => {
                debug!(node = %self.name, at = now + self.power_on_delay, "node powering on");
                self.power = Power::PoweringOn;
                self.settles_at = Some(now + self.power_on_delay);
                Ok(true)
            }
        }
    }

    /// Start a power-off. Returns `false` when the node is already off.
    pub fn power_off(&mut self, now: u64) -> bool {
        if matches!(self.power, Power::Off | Power::PoweringOff) {
            return false;
        }
        debug!(node = %self.name, at = now + self.power_off_delay, "node powering off");
        self.power = Power::PoweringOff;
        self.settles_at = Some(now + self.power_off_delay);
        true
    }

    /// Finish a pending power transition whose delay has elapsed.
    pub fn settle(&mut self, now: u64) {
        let Some(at) = self.settles_at else {
            return;
        };
        if now < at {
            return;
        }
        self.settles_at = None;
        self.power = match self.power {
            Power::PoweringOn if self.failing_power_ons > 0 => {
                self.failing_power_ons -= 1;
                warn!(node = %self.name, "node failed to power on");
                Power::Off
            }
            Power::PoweringOn => Power::On,
            Power::PoweringOff => Power::Off,
            other => other,
        };
    }

    /// What a batch system would report: anything not fully on is off.
    pub fn info(&self) -> NodeInfo {
        let state = match self.power {
            Power::On if self.is_busy() => NodeState::Used,
            Power::On => NodeState::Idle,
            Power::Off | Power::PoweringOn | Power::PoweringOff => NodeState::Off,
        };
        NodeInfo::new(self.name.clone(), self.cores_total, self.memory_total)
            .with_free(self.cores_free, self.memory_free)
            .with_state(state)
    }
}

/// Every machine of the data center, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct NodePool {
    nodes: Vec<SimNode>,
    index: HashMap<String, usize>,
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: SimNode) -> SimResult<()> {
        if self.index.contains_key(&node.name) {
            return Err(SimError::DuplicateNode(node.name));
        }
        self.index.insert(node.name.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn get(&self, name: &str) -> SimResult<&SimNode> {
        self.index
            .get(name)
            .map(|&i| &self.nodes[i])
            .ok_or_else(|| SimError::UnknownNode(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> SimResult<&mut SimNode> {
        match self.index.get(name) {
            Some(&i) => Ok(&mut self.nodes[i]),
            None => Err(SimError::UnknownNode(name.to_string())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SimNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn settle(&mut self, now: u64) {
        for node in &mut self.nodes {
            node.settle(now);
        }
    }

    pub fn infos(&self) -> Vec<NodeInfo> {
        self.nodes.iter().map(SimNode::info).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_on_takes_its_delay() {
        let mut node = SimNode::new("wn0", 4.0, 1024.0).with_delays(10, 5);
        assert!(node.power_on(100).unwrap());
        assert!(!node.power_on(101).unwrap());
        assert_eq!(node.info().state, NodeState::Off);

        node.settle(109);
        assert_eq!(node.power, Power::PoweringOn);
        node.settle(110);
        assert_eq!(node.power, Power::On);
        assert_eq!(node.info().state, NodeState::Idle);
    }

    #[test]
    fn failing_node_stays_off() {
        let mut node = SimNode::new("wn0", 4.0, 1024.0).with_failing_power_ons(1);
        node.power_on(0).unwrap();
        node.settle(5);
        assert_eq!(node.power, Power::Off);

        node.power_on(10).unwrap();
        node.settle(15);
        assert_eq!(node.power, Power::On);
    }

    #[test]
    fn cannot_power_on_while_powering_off() {
        let mut node = SimNode::new("wn0", 4.0, 1024.0).powered_on();
        assert!(node.power_off(0));
        assert!(matches!(node.power_on(1), Err(SimError::PoweringOff(_))));
        node.settle(5);
        assert_eq!(node.power, Power::Off);
        assert!(!node.power_off(6));
    }

    #[test]
    fn busy_node_reports_used() {
        let mut node = SimNode::new("wn0", 4.0, 1024.0).powered_on();
        assert!(node.fits(4.0, 1024.0));
        node.assign(1.0, 256.0);
        let info = node.info();
        assert_eq!(info.state, NodeState::Used);
        assert_eq!(info.slots_free, 3.0);
        node.release(1.0, 256.0);
        assert_eq!(node.info().state, NodeState::Idle);
    }

    #[test]
    fn pool_rejects_duplicate_names() {
        let mut pool = NodePool::new();
        pool.add(SimNode::new("wn0", 1.0, 1.0)).unwrap();
        assert!(matches!(pool.add(SimNode::new("wn0", 1.0, 1.0)), Err(SimError::DuplicateNode(_))));
        assert!(matches!(pool.get("wn9"), Err(SimError::UnknownNode(_))));
        assert_eq!(pool.len(), 1);
    }
}
