//! Drive the daemon against a simulated data center.
//!
//! Time is a [`ManualClock`] moved one second per tick. Each scenario job
//! is launched the way a submission wrapper would: ask the daemon for
//! capacity, wait until the request leaves the queue, then submit the job
//! to the batch system. Jobs with `request = false` are submitted directly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use wattgrid_core::{Clock, Context, Hooks, ManualClock, NodeState, RequestId, WattgridConfig};
use wattgrid_sim::{DataCenter, Power, Scenario, SimJob};

use crate::daemon::Daemon;
use crate::registry::MemoryRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub name: String,
    pub power: Power,
    pub state: Option<NodeState>,
    pub seconds_on: u64,
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub ended_at: u64,
    pub jobs_submitted: usize,
    pub jobs_finished: usize,
    pub jobs_unfinished: usize,
    pub mean_wait: f64,
    pub max_wait: u64,
    pub power_commands: u32,
    /// Sum over nodes of the seconds they were not fully off.
    pub node_seconds_on: u64,
    pub nodes: Vec<NodeReport>,
}

pub struct Simulation {
    daemon: Daemon,
    datacenter: DataCenter,
    clock: Arc<ManualClock>,
    timeline: VecDeque<(u64, SimJob, bool)>,
    waiting: Vec<(RequestId, SimJob)>,
    seconds_on: Vec<(String, u64)>,
    submitted: usize,
}

impl Simulation {
    pub fn new(scenario: &Scenario, config: WattgridConfig, hooks: Arc<dyn Hooks>) -> anyhow::Result<Self> {
        let clock = Arc::new(ManualClock::new(0));
        let pool = scenario.build_pool()?;
        let datacenter = DataCenter::new(pool, clock.clone());
        let ctx = Context::new(config, clock.clone(), hooks);
        let daemon = Daemon::new(
            ctx,
            Arc::new(datacenter.clone()),
            Arc::new(datacenter.clone()),
            Box::new(MemoryRegistry::new()),
        )?;
        let seconds_on = datacenter.nodes().into_iter().map(|n| (n.name, 0)).collect();

        info!(
            nodes = datacenter.nodes().len(),
            jobs = scenario.jobs.len(),
            "simulation ready"
        );
        Ok(Self {
            daemon,
            datacenter,
            clock,
            timeline: scenario.timeline().into(),
            waiting: Vec::new(),
            seconds_on,
            submitted: 0,
        })
    }

    pub fn daemon(&self) -> &Daemon {
        &self.daemon
    }

    pub fn daemon_mut(&mut self) -> &mut Daemon {
        &mut self.daemon
    }

    pub fn datacenter(&self) -> &DataCenter {
        &self.datacenter
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Nothing left to launch, wait for, or run.
    pub fn is_done(&self) -> bool {
        self.timeline.is_empty() && self.waiting.is_empty() && self.datacenter.pending_jobs() == 0
    }

    /// Simulate the current second.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        self.datacenter.advance();
        self.launch_due(now);
        self.submit_granted();
        self.daemon.step();
        self.account_power();
    }

    fn launch_due(&mut self, now: u64) {
        while self.timeline.front().is_some_and(|(at, _, _)| *at <= now) {
            let Some((_, job, with_request)) = self.timeline.pop_front() else {
                break;
            };
            if !with_request {
                self.submit(job);
                continue;
            }
            match self.daemon.request(job.requirement()) {
                Ok(id) => {
                    debug!(job = %job.name, request = id, "waiting for request before submitting");
                    self.waiting.push((id, job));
                }
                Err(e) => {
                    warn!(job = %job.name, error = %e, "request refused, submitting anyway");
                    self.submit(job);
                }
            }
        }
    }

    fn submit_granted(&mut self) {
        let (granted, still_waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiting)
            .into_iter()
            .partition(|(id, _)| !self.daemon.request_in_queue(*id));
        self.waiting = still_waiting;
        for (_, job) in granted {
            self.submit(job);
        }
    }

    fn submit(&mut self, job: SimJob) {
        let name = job.name.clone();
        match self.datacenter.submit(job) {
            Ok(()) => self.submitted += 1,
            Err(e) => warn!(job = %name, error = %e, "could not submit job"),
        }
    }

    fn account_power(&mut self) {
        for node in self.datacenter.nodes() {
            if node.power == Power::Off {
                continue;
            }
            if let Some((_, secs)) = self.seconds_on.iter_mut().find(|(n, _)| *n == node.name) {
                *secs += 1;
            }
        }
    }

    /// Run until everything finished or `until` seconds have passed.
    pub fn run(&mut self, until: u64) -> SimulationReport {
        loop {
            self.tick();
            if self.is_done() || self.clock.now() >= until {
                break;
            }
            self.clock.advance(1);
        }
        self.report()
    }

    /// Keep the control loop going for `secs` more seconds whether or not
    /// work is left, so idle nodes get a chance to power off.
    pub fn linger(&mut self, secs: u64) -> SimulationReport {
        let until = self.clock.now() + secs;
        while self.clock.now() < until {
            self.clock.advance(1);
            self.tick();
        }
        self.report()
    }

    /// Like [`run`](Self::run), but each simulated second takes `tick` of
    /// wall-clock time and the run stops early on shutdown.
    pub async fn run_paced(
        &mut self,
        until: u64,
        tick: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> SimulationReport {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                    if self.is_done() || self.clock.now() >= until {
                        break;
                    }
                    self.clock.advance(1);
                }
                _ = shutdown.changed() => {
                    info!("simulation interrupted");
                    break;
                }
            }
        }
        self.report()
    }

    pub fn report(&self) -> SimulationReport {
        let finished = self.datacenter.finished_jobs();
        let waits: Vec<u64> = finished.iter().filter_map(SimJob::wait_time).collect();
        let mean_wait = if waits.is_empty() {
            0.0
        } else {
            waits.iter().sum::<u64>() as f64 / waits.len() as f64
        };

        let nodes: Vec<NodeReport> = self
            .datacenter
            .nodes()
            .into_iter()
            .map(|n| NodeReport {
                state: self.daemon.node(&n.name).map(|d| d.state()),
                seconds_on: self
                    .seconds_on
                    .iter()
                    .find(|(name, _)| *name == n.name)
                    .map_or(0, |(_, s)| *s),
                power: n.power,
                name: n.name,
            })
            .collect();

        SimulationReport {
            ended_at: self.clock.now(),
            jobs_submitted: self.submitted,
            jobs_finished: finished.len(),
            jobs_unfinished: self.timeline.len() + self.waiting.len() + self.datacenter.pending_jobs(),
            mean_wait,
            max_wait: waits.iter().copied().max().unwrap_or(0),
            power_commands: self.datacenter.power_commands(),
            node_seconds_on: nodes.iter().map(|n| n.seconds_on).sum(),
            nodes,
        }
    }
}
