//! Capacity reservations that outlive a single scheduling pass.
//!
//! When a request is matched onto nodes that are not usable yet (still
//! booting), or has just been served but the batch system has not started
//! using the nodes, the next monitoring snapshot shows that capacity as
//! free. Bookings re-apply the allocation at the start of every pass so
//! later requests do not claim it twice.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};
use wattgrid_core::{NodeState, Request, RequestId, RequestQueue, RequestState};

use crate::monitoring::MonitoringInfo;

/// Nodes reserved for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingInfo {
    pub request_id: RequestId,
    /// One entry per task; a node may appear more than once.
    pub node_ids: Vec<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default)]
pub struct BookingSystem {
    bookings: BTreeMap<RequestId, BookingInfo>,
    /// How long a served request keeps its nodes reserved.
    cooldown_served: u64,
}

impl BookingSystem {
    pub fn new(cooldown_served: u64) -> Self {
        Self {
            bookings: BTreeMap::new(),
            cooldown_served,
        }
    }

    /// Reserve `node_ids` for `request`, replacing any earlier booking.
    pub fn book(&mut self, request: RequestId, node_ids: Vec<String>, now: u64) {
        self.bookings.insert(
            request,
            BookingInfo {
                request_id: request,
                node_ids,
                timestamp: now,
            },
        );
    }

    pub fn get(&self, request: RequestId) -> Option<&BookingInfo> {
        self.bookings.get(&request)
    }

    pub fn bookings(&self) -> impl Iterator<Item = &BookingInfo> {
        self.bookings.values()
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    /// Reconcile bookings with the current queue and snapshot, and apply
    /// the surviving reservations to `monitoring.nodes`.
    ///
    /// - bookings of requests that left the queue are dropped
    /// - requests whose job the batch system already picked up become
    ///   `Served` and lose their booking
    /// - `Attended` requests keep their nodes while any of them is still
    ///   settling, otherwise they go back to `Pending` to be matched again
    /// - `Served` requests keep their nodes for the served cooldown
    pub fn make_books(&mut self, monitoring: &mut MonitoringInfo, requests: &mut RequestQueue) {
        self.bookings.retain(|id, _| requests.contains(*id));
        self.purge_served_jobs(monitoring, requests);

        let mut released = Vec::new();
        for (&id, booking) in &self.bookings {
            let Some(request) = requests.get_mut(id) else {
                continue;
            };

            match request.state() {
                RequestState::Attended => {
                    let still_waiting = booking.node_ids.iter().any(|name| {
                        monitoring
                            .nodes
                            .get(name)
                            .is_some_and(|n| matches!(n.state(), NodeState::PowOff | NodeState::PowOn | NodeState::OnErr))
                    });

                    if still_waiting || request.timestamp_state > monitoring.timestamp_nodes {
                        allocate_booked(monitoring, booking, request);
                    } else {
                        debug!(request = id, nodes = ?booking.node_ids, "booked nodes settled, reconsidering request");
                        released.push(id);
                        request.set_state(RequestState::Pending);
                    }
                }
                RequestState::Served => {
                    let since_served = monitoring.timestamp_nodes as i128 - request.timestamp_state as i128;
                    if since_served < self.cooldown_served as i128 {
                        allocate_booked(monitoring, booking, request);
                    } else {
                        debug!(request = id, "served cooldown elapsed, releasing booked nodes");
                        released.push(id);
                    }
                }
                _ => {}
            }
        }

        for id in released {
            self.bookings.remove(&id);
        }
    }

    fn purge_served_jobs(&mut self, monitoring: &MonitoringInfo, requests: &mut RequestQueue) {
        let Some(jobs) = &monitoring.jobs else {
            return;
        };
        let attended = jobs.ids(Some(RequestState::Attended));

        let mut served = Vec::new();
        for &id in self.bookings.keys() {
            let Some(request) = requests.get_mut(id) else {
                continue;
            };
            let Some(job_id) = &request.job_id else {
                continue;
            };
            if attended.contains(job_id)
                && matches!(request.state(), RequestState::Attended | RequestState::Served)
                && request.timestamp_state < monitoring.timestamp_jobs
            {
                debug!(request = id, job = %job_id, "job already attended by the batch system");
                request.set_state(RequestState::Served);
                served.push(id);
            }
        }

        for id in served {
            self.bookings.remove(&id);
        }
    }
}

fn allocate_booked(monitoring: &mut MonitoringInfo, booking: &BookingInfo, request: &Request) {
    for name in &booking.node_ids {
        match monitoring.nodes.get_mut(name) {
            Some(node) => node.allocate(&request.requirement.resources),
            None => warn!(request = booking.request_id, node = %name, "booked node is not monitored"),
        }
    }
}
