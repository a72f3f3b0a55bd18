//! Ordered node collection with a cumulative filter.
//!
//! Each pass of the matcher narrows the candidate set step by step
//! (enabled flag, then state, then resource fit), so the filter keeps its
//! result between calls until [`NodeList::filter_reset`] is called.

use std::collections::HashMap;

use serde::Serialize;

use crate::node::{Node, NodeState};
use crate::resources::ResourceDescriptor;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct NodeList {
    nodes: Vec<Node>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    #[serde(skip)]
    filtered: Option<Vec<usize>>,
}

impl NodeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep copy, used for speculative allocation.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Insert a node, replacing any node with the same name in place.
    pub fn insert(&mut self, node: Node) {
        match self.index.get(&node.name) {
            Some(&i) => self.nodes[i] = node,
            None => {
                self.index.insert(node.name.clone(), self.nodes.len());
                self.nodes.push(node);
                self.filtered = None;
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.index.get(name).map(|&i| &mut self.nodes[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    /// Node names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    /// Names of the nodes currently in one of `states`.
    pub fn names_in(&self, states: &[NodeState]) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| states.contains(&n.state()))
            .map(|n| n.name.clone())
            .collect()
    }

    // ── Filtering ──────────────────────────────────────────────────

    pub fn filter_reset(&mut self) {
        self.filtered = Some((0..self.nodes.len()).collect());
    }

    /// Narrow the current selection (the whole list if none is active).
    /// The cheap checks run first; constraint evaluation runs last.
    pub fn filter(
        &mut self,
        enabled: Option<bool>,
        states: Option<&[NodeState]>,
        resources: Option<&ResourceDescriptor>,
    ) -> &mut Self {
        let current = self
            .filtered
            .take()
            .unwrap_or_else(|| (0..self.nodes.len()).collect());

        let kept = current
            .into_iter()
            .filter(|&i| {
                let node = &self.nodes[i];
                if let Some(enabled) = enabled
                    && node.enabled != enabled
                {
                    return false;
                }
                if let Some(states) = states
                    && !states.contains(&node.state())
                {
                    return false;
                }
                resources.is_none_or(|r| node.meets_resources(r))
            })
            .collect();

        self.filtered = Some(kept);
        self
    }

    /// Names in the current selection, in list order.
    pub fn filtered_names(&self) -> Vec<String> {
        match &self.filtered {
            Some(sel) => sel.iter().map(|&i| self.nodes[i].name.clone()).collect(),
            None => self.names(),
        }
    }

    pub fn filter_count(&self) -> usize {
        self.filtered.as_ref().map_or(self.nodes.len(), Vec::len)
    }
}
