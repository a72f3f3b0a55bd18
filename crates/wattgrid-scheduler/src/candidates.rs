//! Power decisions accumulated over one pass.

use std::collections::HashMap;

use serde::Serialize;
use wattgrid_core::RequestId;

/// Nodes to power on (with the requests that need each one) and nodes to
/// power off. Both keep insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Candidates {
    on_order: Vec<String>,
    on: HashMap<String, Vec<RequestId>>,
    off: Vec<String>,
}

impl Candidates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a node for power-on, optionally on behalf of a request.
    pub fn add_on(&mut self, node: &str, request: Option<RequestId>) {
        let entry = self.on.entry(node.to_string()).or_insert_with(|| {
            self.on_order.push(node.to_string());
            Vec::new()
        });
        if let Some(id) = request
            && !entry.contains(&id)
        {
            entry.push(id);
        }
    }

    pub fn contains_on(&self, node: &str) -> bool {
        self.on.contains_key(node)
    }

    pub fn on_nodes(&self) -> &[String] {
        &self.on_order
    }

    /// Requests that justified powering on `node`.
    pub fn requests_for(&self, node: &str) -> &[RequestId] {
        self.on.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn add_off(&mut self, node: &str) {
        if !self.contains_off(node) {
            self.off.push(node.to_string());
        }
    }

    pub fn contains_off(&self, node: &str) -> bool {
        self.off.iter().any(|n| n == node)
    }

    /// Drop a power-off decision. Returns whether there was one.
    pub fn remove_off(&mut self, node: &str) -> bool {
        let before = self.off.len();
        self.off.retain(|n| n != node);
        self.off.len() != before
    }

    pub fn off_nodes(&self) -> &[String] {
        &self.off
    }

    /// Fold another set of power-on decisions into this one.
    pub fn merge_on(&mut self, other: Candidates) {
        let Candidates { on_order, mut on, .. } = other;
        for node in on_order {
            let requests = on.remove(&node).unwrap_or_default();
            if requests.is_empty() {
                self.add_on(&node, None);
            }
            for id in requests {
                self.add_on(&node, Some(id));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.on_order.is_empty() && self.off.is_empty()
    }
}
