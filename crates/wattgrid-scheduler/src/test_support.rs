//! Fixtures shared by the policy tests.

use std::sync::Arc;

use wattgrid_core::{
    Context, ManualClock, NoopHooks, Node, NodeInfo, NodeList, NodeState, Request, ResourceDescriptor,
    ResourceRequirement, WattgridConfig,
};

pub struct Cluster {
    pub ctx: Context,
    pub clock: Arc<ManualClock>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_config(WattgridConfig::default())
    }

    pub fn with_config(config: WattgridConfig) -> Self {
        let clock = Arc::new(ManualClock::new(1000));
        let ctx = Context::new(config, clock.clone(), Arc::new(NoopHooks));
        Self { ctx, clock }
    }

    pub fn node(&self, name: &str, slots: f64, state: NodeState) -> Node {
        Node::from_info(&NodeInfo::new(name, slots, 8192.0).with_state(state), self.ctx.clone())
    }

    pub fn nodes(&self, spec: &[(&str, f64, NodeState)]) -> NodeList {
        let mut list = NodeList::new();
        for &(name, slots, state) in spec {
            list.insert(self.node(name, slots, state));
        }
        list
    }
}

pub fn request(cluster: &Cluster, slots: f64) -> Request {
    Request::new(
        ResourceRequirement::single(ResourceDescriptor::new(Some(slots), None)),
        cluster.clock.clone(),
    )
}
