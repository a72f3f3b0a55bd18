use tracing::debug;
use wattgrid_core::{Context, NodeState, RequestQueue};

use crate::candidates::Candidates;
use crate::error::SchedulerResult;
use crate::monitoring::MonitoringInfo;
use crate::pipeline::SchedulerPolicy;

/// Proposes powering off enabled nodes that have been idle for
/// `idle_time` seconds and on for at least `cooldown_nodes` seconds.
pub struct IdleOff {
    ctx: Context,
}

impl IdleOff {
    pub const NAME: &'static str = "idle_off";

    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

impl SchedulerPolicy for IdleOff {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schedule(
        &mut self,
        _requests: &mut RequestQueue,
        monitoring: &mut MonitoringInfo,
        candidates: &mut Candidates,
    ) -> SchedulerResult<()> {
        let now = self.ctx.now();
        let scheduling = &self.ctx.config.scheduling;
        let idle_since = now.saturating_sub(scheduling.idle_time);
        let on_since = now.saturating_sub(scheduling.cooldown_nodes);

        for node in monitoring.nodes.iter() {
            if node.enabled
                && node.state() == NodeState::Idle
                && node.timestamp_poweredon < on_since
                && node.timestamp_state < idle_since
            {
                debug!(node = %node.name, idle_since = node.timestamp_state, "node has been idle for too long");
                candidates.add_off(&node.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Cluster;
    use wattgrid_core::WattgridConfig;

    fn run(c: &Cluster, info: &mut MonitoringInfo) -> Candidates {
        let mut candidates = Candidates::new();
        IdleOff::new(c.ctx.clone())
            .schedule(&mut RequestQueue::new(), info, &mut candidates)
            .unwrap();
        candidates
    }

    #[test]
    fn long_idle_nodes_are_proposed() {
        let c = Cluster::new();
        let nodes = c.nodes(&[
            ("wn0", 4.0, NodeState::Idle),
            ("wn1", 4.0, NodeState::Used),
            ("wn2", 4.0, NodeState::Off),
        ]);
        c.clock.advance(1801);
        let mut info = MonitoringInfo::new(nodes, 2801, None, 0);
        assert_eq!(run(&c, &mut info).off_nodes(), ["wn0"]);
    }

    #[test]
    fn short_idle_nodes_are_kept() {
        let c = Cluster::new();
        let nodes = c.nodes(&[("wn0", 4.0, NodeState::Idle)]);
        c.clock.advance(1800);
        let mut info = MonitoringInfo::new(nodes, 2800, None, 0);
        assert!(run(&c, &mut info).is_empty());
    }

    #[test]
    fn disabled_nodes_are_kept() {
        let c = Cluster::new();
        let mut nodes = c.nodes(&[("wn0", 4.0, NodeState::Idle)]);
        nodes.get_mut("wn0").unwrap().disable();
        c.clock.advance(5000);
        let mut info = MonitoringInfo::new(nodes, 6000, None, 0);
        assert!(run(&c, &mut info).is_empty());
    }

    #[test]
    fn recently_powered_on_nodes_are_kept() {
        let mut config = WattgridConfig::default();
        config.scheduling.idle_time = 10;
        config.scheduling.cooldown_nodes = 600;
        let c = Cluster::with_config(config);
        let nodes = c.nodes(&[("wn0", 4.0, NodeState::Idle)]);

        c.clock.advance(300);
        let mut info = MonitoringInfo::new(nodes.clone(), 1300, None, 0);
        assert!(run(&c, &mut info).is_empty());

        c.clock.advance(301);
        let mut info = MonitoringInfo::new(nodes, 1601, None, 0);
        assert_eq!(run(&c, &mut info).off_nodes(), ["wn0"]);
    }
}
