use tracing::debug;
use wattgrid_core::{Context, NodeState, RequestQueue};

use crate::candidates::Candidates;
use crate::error::SchedulerResult;
use crate::monitoring::MonitoringInfo;
use crate::pipeline::SchedulerPolicy;

/// Keeps `extra_capacity.slots_free` slots and `extra_capacity.nodes_free`
/// idle nodes available.
///
/// Runs every `extra_capacity.period` seconds, or right away when an
/// earlier policy proposed power-offs. Nodes about to be powered off are
/// reclaimed first, then powered-off nodes, each group by name.
pub struct FreeCapacity {
    ctx: Context,
    last_run: u64,
}

impl FreeCapacity {
    pub const NAME: &'static str = "free_capacity";

    pub fn new(ctx: Context) -> Self {
        let last_run = ctx.now();
        Self { ctx, last_run }
    }
}

impl SchedulerPolicy for FreeCapacity {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schedule(
        &mut self,
        _requests: &mut RequestQueue,
        monitoring: &mut MonitoringInfo,
        candidates: &mut Candidates,
    ) -> SchedulerResult<()> {
        let extra = &self.ctx.config.extra_capacity;
        let now = self.ctx.now();
        if now.saturating_sub(self.last_run) < extra.period && candidates.off_nodes().is_empty() {
            return Ok(());
        }
        self.last_run = now;

        let retries = self.ctx.config.scheduling.retries_power_on;
        let mut slots_free = 0.0_f64;
        let mut nodes_free = 0_u32;
        let mut cancel_off: Vec<(&str, f64)> = Vec::new();
        let mut power_up: Vec<(&str, f64)> = Vec::new();

        for node in monitoring.nodes.iter() {
            match node.state() {
                NodeState::Idle | NodeState::Used | NodeState::OnErr => {
                    let free = node.slots_free_observed.max(0.0);
                    if candidates.contains_off(&node.name) {
                        cancel_off.push((node.name.as_str(), free));
                    } else {
                        slots_free += free;
                        if node.state() == NodeState::Idle {
                            nodes_free += 1;
                        }
                    }
                }
                NodeState::PowOn => {
                    slots_free += node.slots_total.max(0.0);
                    nodes_free += 1;
                }
                NodeState::Off => power_up.push((node.name.as_str(), node.slots_total.max(0.0))),
                NodeState::OffErr if node.power_on_failures < retries => {
                    power_up.push((node.name.as_str(), node.slots_total.max(0.0)));
                }
                _ => {}
            }
        }

        let mut slots_needed = (extra.slots_free - slots_free).max(0.0);
        let mut nodes_needed = extra.nodes_free.saturating_sub(nodes_free);
        if slots_needed <= 0.0 && nodes_needed == 0 {
            return Ok(());
        }

        cancel_off.sort_by(|a, b| a.0.cmp(b.0));
        power_up.sort_by(|a, b| a.0.cmp(b.0));

        let mut chosen = Vec::new();
        for (name, slots) in cancel_off.into_iter().chain(power_up) {
            if slots_needed <= 0.0 && nodes_needed == 0 {
                break;
            }
            slots_needed -= slots;
            let counts_as_free = monitoring
                .nodes
                .get(name)
                .is_some_and(|n| matches!(n.state(), NodeState::Idle | NodeState::PowOn | NodeState::Off | NodeState::OffErr));
            if counts_as_free {
                nodes_needed = nodes_needed.saturating_sub(1);
            }
            chosen.push(name.to_string());
        }

        if chosen.is_empty() {
            debug!(slots = slots_needed, nodes = nodes_needed, "no node left to keep free capacity");
            return Ok(());
        }

        debug!(nodes = ?chosen, "powering on nodes to keep free capacity");
        for name in &chosen {
            if !candidates.remove_off(name) {
                candidates.add_on(name, None);
            }
        }
        Ok(())
    }
}
