//! Matches queued requests against nodes, widening the candidate pool tier
//! by tier.
//!
//! ```text
//! tier 1  Idle | Used | OnErr              met → Served (Blocked behind a live request)
//! tier 2  + PowOn                          met → Attended
//!         (stop if max_booting_nodes reached)
//! tier 3  + Off already chosen this pass   met → Attended
//! tier 4  + remaining enabled Off          met → Attended
//! tier 5  + enabled PowOff                 met → Attended
//! tier 6  nothing live ahead → NotServed (empty pool) or Blocked
//!         otherwise stop: later requests wait their turn
//! ```
//!
//! Every request that stays `Pending` or `Attended` counts as live and holds
//! back the ones behind it.

use tracing::debug;
use wattgrid_core::{Context, NodeList, NodeState, Request, RequestQueue, RequestState, ResourceRequirement};

use crate::booking::BookingSystem;
use crate::candidates::Candidates;
use crate::error::SchedulerResult;
use crate::monitoring::MonitoringInfo;
use crate::pipeline::SchedulerPolicy;

const ON: &[NodeState] = &[NodeState::Idle, NodeState::Used, NodeState::OnErr];

/// Outcome of matching one request.
#[derive(Debug, PartialEq)]
enum Match {
    /// Take one task's worth of capacity on each entry of `nodes`.
    Allocate {
        state: RequestState,
        nodes: Vec<String>,
        wake: Vec<String>,
    },
    /// Leave this request and every later one for the next pass.
    Hold,
}

pub struct RequestMatcher {
    ctx: Context,
    bookings: BookingSystem,
}

impl RequestMatcher {
    pub const NAME: &'static str = "requests";

    pub fn new(ctx: Context) -> Self {
        let bookings = BookingSystem::new(ctx.config.monitoring.cooldown_served_requests);
        Self { ctx, bookings }
    }

    pub fn bookings(&self) -> &BookingSystem {
        &self.bookings
    }

    fn match_request(
        &self,
        request: &Request,
        nodes: &mut NodeList,
        local: &Candidates,
        powering_on: usize,
        alive: usize,
    ) -> Match {
        let req = &request.requirement;
        let res = &req.resources;

        let mut pool = tier(nodes, None, ON, req);
        if let Some(matched) = nodes_meet_resources(req, nodes, &pool) {
            let state = if alive > 0 {
                debug!(request = request.id, alive, "resources available but held behind live requests");
                RequestState::Blocked
            } else {
                debug!(request = request.id, nodes = ?matched, "serving request with nodes that are on");
                RequestState::Served
            };
            return Match::Allocate {
                state,
                nodes: matched,
                wake: Vec::new(),
            };
        }

        pool.extend(tier(nodes, None, &[NodeState::PowOn], req));
        if let Some(matched) = nodes_meet_resources(req, nodes, &pool) {
            debug!(request = request.id, "nodes being powered on will serve request");
            return attended(matched, &[]);
        }

        let max = self.ctx.config.scheduling.max_booting_nodes;
        if max > 0 && powering_on + local.on_nodes().len() >= max {
            debug!(max, "maximum number of booting nodes reached");
            return Match::Hold;
        }

        let off = tier(nodes, Some(true), &[NodeState::Off], req);
        let (chosen, fresh): (Vec<String>, Vec<String>) = off.iter().cloned().partition(|n| local.contains_on(n));

        pool.extend(chosen);
        if let Some(matched) = nodes_meet_resources(req, nodes, &pool) {
            debug!(request = request.id, "nodes already chosen for power-on will serve request");
            return attended(matched, &off);
        }

        pool.extend(fresh);
        if let Some(matched) = nodes_meet_resources(req, nodes, &pool) {
            debug!(request = request.id, "powering on nodes to serve request");
            return attended(matched, &off);
        }

        let powering_off = tier(nodes, Some(true), &[NodeState::PowOff], req);
        pool.extend(powering_off.iter().cloned());
        if let Some(matched) = nodes_meet_resources(req, nodes, &pool) {
            debug!(request = request.id, "waiting for nodes being powered off to serve request");
            let wake: Vec<String> = off.into_iter().chain(powering_off).collect();
            return attended(matched, &wake);
        }

        if alive > 0 {
            return Match::Hold;
        }

        let state = if pool.is_empty() {
            debug!(request = request.id, slots = ?res.slots, "request cannot be satisfied");
            RequestState::NotServed
        } else {
            debug!(request = request.id, "request cannot be satisfied yet, but some nodes fit");
            RequestState::Blocked
        };
        Match::Allocate {
            state,
            nodes: Vec::new(),
            wake: Vec::new(),
        }
    }
}

fn attended(matched: Vec<String>, powered_down: &[String]) -> Match {
    let wake = matched
        .iter()
        .filter(|n| powered_down.contains(n))
        .cloned()
        .collect();
    Match::Allocate {
        state: RequestState::Attended,
        nodes: matched,
        wake,
    }
}

/// Nodes in `states` that fit one task of `req` right now.
fn tier(nodes: &mut NodeList, enabled: Option<bool>, states: &[NodeState], req: &ResourceRequirement) -> Vec<String> {
    nodes.filter_reset();
    nodes.filter(enabled, Some(states), Some(&req.resources)).filtered_names()
}

/// Try to place every task of `req` on `pool`, first fit, on a scratch copy
/// of `nodes`. Returns one node name per placed task.
fn nodes_meet_resources(req: &ResourceRequirement, nodes: &NodeList, pool: &[String]) -> Option<Vec<String>> {
    let mut scratch = nodes.duplicate();
    let mut tasks = req.task_count;
    let mut placed = Vec::new();

    for name in pool {
        let Some(node) = scratch.get_mut(name) else {
            continue;
        };
        let mut per_node = req.max_tasks_per_node;
        while tasks > 0 && per_node > 0 && node.meets_resources(&req.resources) {
            node.allocate(&req.resources);
            placed.push(name.clone());
            per_node -= 1;
            tasks -= 1;
        }
    }

    (tasks == 0).then_some(placed)
}

impl SchedulerPolicy for RequestMatcher {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schedule(
        &mut self,
        requests: &mut RequestQueue,
        monitoring: &mut MonitoringInfo,
        candidates: &mut Candidates,
    ) -> SchedulerResult<()> {
        self.bookings.make_books(monitoring, requests);

        let nodes = &mut monitoring.nodes;
        let powering_on = nodes.names_in(&[NodeState::PowOn]).len();
        let mut local = Candidates::new();
        let mut alive = 0usize;

        for id in requests.ids() {
            let Some(request) = requests.get_mut(id) else {
                continue;
            };

            if matches!(request.state(), RequestState::Pending | RequestState::Blocked) {
                let Match::Allocate { state, nodes: matched, wake } =
                    self.match_request(request, nodes, &local, powering_on, alive)
                else {
                    break;
                };

                request.set_state(state);
                for name in &matched {
                    if let Some(node) = nodes.get_mut(name) {
                        node.allocate(&request.requirement.resources);
                    }
                }
                for name in &wake {
                    local.add_on(name, Some(id));
                }
                if !matched.is_empty() {
                    debug!(request = id, nodes = ?matched, "nodes allocated for request");
                    self.bookings.book(id, matched, self.ctx.now());
                }
            }

            if matches!(request.state(), RequestState::Pending | RequestState::Attended) {
                alive += 1;
            }
        }

        nodes.filter_reset();
        candidates.merge_on(local);
        Ok(())
    }
}
