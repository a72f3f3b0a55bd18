//! The control loop.
//!
//! The daemon owns the authoritative view of the cluster: the node list,
//! the job list, and the request queue. Each periodic task reads the
//! platform, runs the scheduler pipeline, or issues power commands against
//! that view; tasks never run concurrently.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use wattgrid_core::{
    Context, CoreError, HookEvent, JobList, Node, NodeInfo, NodeList, NodeState, PlatformSource, PowerController,
    Request, RequestId, RequestQueue, RequestState, ResourceRequirement,
};
use wattgrid_scheduler::{MonitoringInfo, Pipeline};

use crate::error::{DaemonError, DaemonResult};
use crate::registry::HostRegistry;
use crate::tasks::Tasks;

/// Point-in-time view of the cluster, as reported by `wattd status`.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub timestamp: u64,
    pub nodes: Vec<Node>,
    pub requests: Vec<Request>,
    pub jobs: usize,
}

pub struct Daemon {
    ctx: Context,
    platform: Arc<dyn PlatformSource>,
    power: Arc<dyn PowerController>,
    registry: Box<dyn HostRegistry>,
    pipeline: Pipeline,
    tasks: Tasks,
    nodes: Option<NodeList>,
    jobs: Option<JobList>,
    requests: RequestQueue,
    timestamp_nodes: Option<u64>,
    timestamp_jobs: Option<u64>,
    timestamp_mark: u64,
}

impl Daemon {
    pub fn new(
        ctx: Context,
        platform: Arc<dyn PlatformSource>,
        power: Arc<dyn PowerController>,
        registry: Box<dyn HostRegistry>,
    ) -> DaemonResult<Self> {
        ctx.config.validate().map_err(|e| DaemonError::Config(e.to_string()))?;
        let pipeline = Pipeline::from_config(&ctx).map_err(|e| DaemonError::Config(e.to_string()))?;
        let now = ctx.now();
        let tasks = Tasks::from_config(&ctx.config, now);

        Ok(Self {
            ctx,
            platform,
            power,
            registry,
            pipeline,
            tasks,
            nodes: None,
            jobs: None,
            requests: RequestQueue::new(),
            timestamp_nodes: None,
            timestamp_jobs: None,
            timestamp_mark: now,
        })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn nodes(&self) -> Option<&NodeList> {
        self.nodes.as_ref()
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.as_ref()?.get(name)
    }

    pub fn jobs(&self) -> Option<&JobList> {
        self.jobs.as_ref()
    }

    pub fn requests(&self) -> &RequestQueue {
        &self.requests
    }

    /// Earliest time a periodic task is due.
    pub fn next_due(&self) -> Option<u64> {
        self.tasks.next_due()
    }

    /// Run every periodic task that is due.
    pub fn step(&mut self) {
        let now = self.ctx.now();
        if self.tasks.nodes.due(now) {
            self.monitor_nodes();
            if self.tasks.jobs_with_nodes {
                self.monitor_jobs();
            }
        }
        if self.tasks.jobs.due(now) {
            self.monitor_jobs();
        }
        if self.tasks.schedule.due(now) {
            self.schedule();
        }
        if self.tasks.lifecycle.due(now) {
            self.platform.lifecycle();
            self.power.lifecycle();
        }
        if self.tasks.recovery.due(now) {
            self.recover_nodes();
        }
    }

    // ── Monitoring ─────────────────────────────────────────────────

    /// Fold the platform's node inventory into the node list.
    pub fn monitor_nodes(&mut self) {
        let now = self.ctx.now();
        let config = self.ctx.config.clone();
        let monitoring = &config.monitoring;

        let inventory = match self.platform.node_inventory() {
            Some(inventory) => inventory,
            None => {
                let failing_for = self.timestamp_nodes.map(|t| now.saturating_sub(t));
                if let Some(secs) = failing_for
                    && secs < monitoring.nodes_fail_grace
                {
                    debug!(secs, "node inventory unavailable, within grace time");
                    return;
                }
                warn!(secs = ?failing_for, "node inventory unavailable");
                Vec::new()
            }
        };

        if self.nodes.is_none() {
            self.nodes = Some(self.seed_nodes(&inventory));
        }
        let Some(nodes) = self.nodes.as_mut() else {
            return;
        };

        let mut changed = Vec::new();
        for info in &inventory {
            match nodes.get_mut(&info.name) {
                Some(node) => {
                    let (updated, _) = node.update_info(info);
                    if updated {
                        changed.push(info.name.clone());
                    }
                }
                None => {
                    warn!(node = %info.name, "node has just appeared");
                    nodes.insert(Node::from_info(info, self.ctx.clone()));
                    changed.push(info.name.clone());
                }
            }
        }

        let observed: HashSet<&str> = inventory.iter().map(|i| i.name.as_str()).collect();
        for node in nodes.iter_mut() {
            if node.state() != NodeState::Unknown && !observed.contains(node.name.as_str()) {
                warn!(node = %node.name, "node has disappeared");
                node.set_state(NodeState::Unknown, false);
                changed.push(node.name.clone());
            }
        }

        for node in nodes.iter_mut() {
            let elapsed = now.saturating_sub(node.timestamp_state);
            if node.state() == NodeState::PowOn && elapsed > monitoring.max_wait_poweron {
                node.set_state(NodeState::OffErr, false);
                changed.push(node.name.clone());
            }
            if node.state() == NodeState::PowOff && elapsed > monitoring.max_wait_poweroff {
                node.set_state(NodeState::OnErr, false);
                changed.push(node.name.clone());
            }
        }

        for name in &changed {
            if let Some(node) = nodes.get(name) {
                debug!(node = %name, state = %node.state(), "node changed");
                self.registry.store_node(node);
            }
        }

        self.timestamp_nodes = Some(now);
        self.update_enabled();
    }

    /// First view of the cluster: everything the platform reports, plus
    /// the registered hosts it does not, as `Unknown` with their last
    /// stored capacity when there is one.
    fn seed_nodes(&mut self, inventory: &[NodeInfo]) -> NodeList {
        let mut nodes = NodeList::new();
        for info in inventory {
            nodes.insert(Node::from_info(info, self.ctx.clone()));
        }
        for (host, _) in self.registry.hosts() {
            if nodes.contains(&host) {
                continue;
            }
            let info = match self.registry.last_info(&host) {
                Some(info) => info.with_state(NodeState::Unknown),
                None => NodeInfo::unobserved(host),
            };
            nodes.insert(Node::from_info(&info, self.ctx.clone()));
        }
        for node in nodes.iter() {
            self.registry.store_node(node);
        }
        info!(nodes = nodes.len(), observed = inventory.len(), "first node monitoring");
        nodes
    }

    /// Registry flags first, then `disabled_hosts`, which always wins.
    fn update_enabled(&mut self) {
        let Some(nodes) = self.nodes.as_mut() else {
            return;
        };
        for (host, enabled) in self.registry.hosts() {
            if let Some(node) = nodes.get_mut(&host) {
                node.enabled = enabled;
            }
        }
        for host in &self.ctx.config.general.disabled_hosts {
            if let Some(node) = nodes.get_mut(host) {
                node.disable();
            }
        }
    }

    /// Fold the platform's job inventory into the job list.
    pub fn monitor_jobs(&mut self) {
        let now = self.ctx.now();
        let config = self.ctx.config.clone();
        let monitoring = &config.monitoring;

        let inventory = match self.platform.job_inventory() {
            Some(inventory) => inventory,
            None => {
                let failing_for = self.timestamp_jobs.map(|t| now.saturating_sub(t));
                if let Some(secs) = failing_for
                    && secs < monitoring.jobs_fail_grace
                {
                    debug!(secs, "job inventory unavailable, within grace time");
                    return;
                }
                warn!(secs = ?failing_for, "job inventory unavailable");
                Vec::new()
            }
        };

        let jobs = self.jobs.get_or_insert_with(|| {
            debug!(jobs = inventory.len(), "first job monitoring");
            JobList::new()
        });

        for info in &inventory {
            if let Some(job) = jobs.get_mut(&info.job_id) {
                job.update_info(info);
                continue;
            }
            debug!(job = %info.job_id, "job has just appeared");
            if let Err(e) = jobs.append(Request::from_job_info(info, self.ctx.clock.clone())) {
                warn!(job = %info.job_id, error = %e, "ignoring job");
            }
        }

        let observed: HashSet<&str> = inventory.iter().map(|j| j.job_id.as_str()).collect();
        let mut purged = Vec::new();
        for job_id in jobs.ids(None) {
            let Some(job) = jobs.get_mut(&job_id) else {
                continue;
            };
            let seen = observed.contains(job_id.as_str());
            if !seen && !job.state().is_terminal() {
                debug!(job = %job_id, "job has disappeared");
                job.set_state(RequestState::Disappeared);
            }
            if !seen
                && job.state().is_terminal()
                && now.saturating_sub(job.timestamp_state) > monitoring.cooldown_served_jobs
            {
                purged.push(job_id);
            }
        }
        for job_id in purged {
            jobs.remove(&job_id);
        }

        self.timestamp_jobs = Some(now);
    }

    // ── Scheduling ─────────────────────────────────────────────────

    fn purge_served_requests(&mut self) {
        let now = self.ctx.now();
        let cooldown = self.ctx.config.monitoring.cooldown_served_requests;
        let expired: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|r| r.state().is_terminal() && now.saturating_sub(r.timestamp_state) > cooldown)
            .map(|r| r.id)
            .collect();
        for id in expired {
            debug!(request = id, "purging request");
            self.requests.remove(id);
        }
    }

    /// One scheduling pass: run the pipeline over the current view, then
    /// power off and power on what it decided.
    pub fn schedule(&mut self) {
        self.purge_served_requests();

        let now = self.ctx.now();
        if now.saturating_sub(self.timestamp_mark) > self.ctx.config.general.logger_mark {
            self.timestamp_mark = now;
            info!(now, "logging mark, everything continues");
        }

        if self.nodes.is_none() && self.jobs.is_none() {
            debug!("no monitoring information yet, skipping scheduling");
            return;
        }

        // The pass allocates speculatively, so it works on a copy of the
        // nodes; only the platform's view is kept between passes.
        let mut monitoring = MonitoringInfo::new(
            self.nodes.as_ref().map(NodeList::duplicate).unwrap_or_default(),
            self.timestamp_nodes.unwrap_or_default(),
            self.jobs.take(),
            self.timestamp_jobs.unwrap_or_default(),
        );
        let candidates = self.pipeline.run(&mut self.requests, &mut monitoring);
        self.jobs = monitoring.jobs;

        if !candidates.off_nodes().is_empty() {
            info!(nodes = ?candidates.off_nodes(), "powering off nodes");
            for name in candidates.off_nodes() {
                if let Err(e) = self.power_off(name, false) {
                    debug!(node = %name, error = %e, "node not powered off");
                }
            }
        }
        if !candidates.on_nodes().is_empty() {
            info!(nodes = ?candidates.on_nodes(), "powering on nodes");
            for name in candidates.on_nodes() {
                if let Err(e) = self.power_on(name, false) {
                    debug!(node = %name, error = %e, "node not powered on");
                }
            }
        }
    }

    // ── Power commands ─────────────────────────────────────────────

    /// Power a node on. Returns the node that was actually acted on.
    pub fn power_on(&mut self, name: &str, force: bool) -> DaemonResult<String> {
        let node = self.node(name).ok_or_else(|| DaemonError::UnknownNode(name.to_string()))?;
        if !node.enabled && !force {
            warn!(node = name, "node is disabled, not powering it on");
            return Err(DaemonError::Disabled(name.to_string()));
        }
        if matches!(
            node.state(),
            NodeState::Idle | NodeState::Used | NodeState::PowOn | NodeState::OnErr
        ) {
            debug!(node = name, state = %node.state(), "node is already on or powering on");
            return Ok(name.to_string());
        }

        self.ctx.fire(HookEvent::PrePowerOn { node: name.to_string() });
        match self.power.power_on(name) {
            Ok(resolved) => {
                let target = self.resolve(name, &resolved, "on");
                self.transition(&target, &[NodeState::PowOn]);
                self.ctx.fire(HookEvent::PostPowerOn {
                    node: target.clone(),
                    success: true,
                    resolved,
                });
                info!(node = %target, "node powered on");
                Ok(target)
            }
            Err(e) => {
                warn!(node = name, error = %e, "could not power on node, it will be considered off with errors");
                self.transition(name, &[NodeState::PowOn]);
                self.ctx.fire(HookEvent::PostPowerOn {
                    node: name.to_string(),
                    success: false,
                    resolved: String::new(),
                });
                self.transition(name, &[NodeState::OffErr]);
                Err(DaemonError::PowerFailed {
                    node: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Power a node off. Returns the node that was actually acted on.
    pub fn power_off(&mut self, name: &str, force: bool) -> DaemonResult<String> {
        let node = self.node(name).ok_or_else(|| DaemonError::UnknownNode(name.to_string()))?;
        if !node.enabled && !force {
            warn!(node = name, "node is disabled, not powering it off");
            return Err(DaemonError::Disabled(name.to_string()));
        }
        if matches!(node.state(), NodeState::Off | NodeState::PowOff | NodeState::OffErr) {
            debug!(node = name, state = %node.state(), "node is already off or powering off");
            return Ok(name.to_string());
        }

        self.ctx.fire(HookEvent::PrePowerOff { node: name.to_string() });
        match self.power.power_off(name) {
            Ok(resolved) => {
                let target = self.resolve(name, &resolved, "off");
                self.transition(&target, &[NodeState::PowOff]);
                self.ctx.fire(HookEvent::PostPowerOff {
                    node: target.clone(),
                    success: true,
                    resolved,
                });
                info!(node = %target, "node powered off");
                Ok(target)
            }
            Err(e) => {
                warn!(node = name, error = %e, "could not power off node, it will be considered on with errors");
                self.transition(name, &[NodeState::PowOff]);
                self.ctx.fire(HookEvent::PostPowerOff {
                    node: name.to_string(),
                    success: false,
                    resolved: String::new(),
                });
                self.transition(name, &[NodeState::OnErr]);
                Err(DaemonError::PowerFailed {
                    node: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// The node a power command landed on: the controller's answer when we
    /// manage that node, the requested one otherwise.
    fn resolve(&self, requested: &str, resolved: &str, action: &str) -> String {
        if resolved == requested || resolved.is_empty() {
            return requested.to_string();
        }
        if self.node(resolved).is_some() {
            warn!(requested, resolved, action, "power command acted on another node");
            resolved.to_string()
        } else {
            warn!(requested, resolved, action, "power command acted on an unmanaged node, keeping the requested one");
            requested.to_string()
        }
    }

    /// Apply `states` in order to a node and record it.
    fn transition(&mut self, name: &str, states: &[NodeState]) {
        let Some(node) = self.nodes.as_mut().and_then(|n| n.get_mut(name)) else {
            return;
        };
        for state in states {
            node.set_state(*state, false);
        }
        self.registry.store_node(node);
    }

    // ── Recovery ───────────────────────────────────────────────────

    /// Give failed nodes another chance while they are under their retry
    /// limits: `OffErr` goes back to `Off`, `OnErr` back to `Idle`.
    pub fn recover_nodes(&mut self) {
        let config = self.ctx.config.clone();
        let scheduling = &config.scheduling;
        let Some(nodes) = self.nodes.as_mut() else {
            return;
        };

        let mut recovered = Vec::new();
        for node in nodes.iter_mut() {
            let target = match node.state() {
                NodeState::OffErr if node.power_on_failures < scheduling.retries_power_on => NodeState::Off,
                NodeState::OnErr if node.power_off_failures < scheduling.retries_power_off => NodeState::Idle,
                _ => continue,
            };
            match node.recover(Some(target)) {
                Ok(_) => {
                    self.registry.store_node(node);
                    recovered.push(node.name.clone());
                }
                Err(e) => warn!(node = %node.name, error = %e, "could not recover node"),
            }
        }
        if !recovered.is_empty() {
            debug!(nodes = ?recovered, "tried to recover nodes");
        }
    }

    /// Move a node out of an error or unknown state into the last state
    /// the registry recorded for it.
    pub fn recover_node(&mut self, name: &str) -> DaemonResult<NodeState> {
        let node = self
            .nodes
            .as_mut()
            .and_then(|n| n.get_mut(name))
            .ok_or_else(|| DaemonError::UnknownNode(name.to_string()))?;
        let previous = self.registry.last_differing_state(name, node.state());
        node.recover(previous)?;
        self.registry.store_node(node);
        Ok(node.state())
    }

    // ── Administration ─────────────────────────────────────────────

    /// Queue a request for capacity.
    pub fn request(&mut self, requirement: ResourceRequirement) -> DaemonResult<RequestId> {
        if let Some((source, e)) = requirement.resources.invalid_constraint() {
            warn!(constraint = source, error = %e, "rejecting request");
            return Err(CoreError::Expression(e.clone()).into());
        }

        let request = Request::new(requirement, self.ctx.clock.clone());
        let resources = &request.requirement.resources;
        self.ctx.fire(HookEvent::Request {
            id: request.id,
            slots: resources.slots,
            memory: resources.memory,
            task_count: request.requirement.task_count,
            max_tasks_per_node: request.requirement.max_tasks_per_node,
            constraints: resources.constraints.iter().map(|c| c.source().to_string()).collect(),
        });
        debug!(%request, "new request");
        let id = request.id;
        self.requests.append(request)?;
        Ok(id)
    }

    /// Whether a request is still waiting to be resolved.
    pub fn request_in_queue(&self, id: RequestId) -> bool {
        self.requests.get(id).is_some_and(|r| !r.state().is_terminal())
    }

    pub fn enable_host(&mut self, name: &str, enabled: bool) -> DaemonResult<()> {
        if self.node(name).is_none() {
            return Err(DaemonError::UnknownNode(name.to_string()));
        }
        info!(node = name, enabled, "setting host enable flag");
        self.registry.enable_host(name, enabled);
        self.update_enabled();
        Ok(())
    }

    /// Force a node back to `Idle`, whatever the state machine thinks.
    pub fn reset_node_state(&mut self, name: &str) -> DaemonResult<NodeState> {
        let node = self
            .nodes
            .as_mut()
            .and_then(|n| n.get_mut(name))
            .ok_or_else(|| DaemonError::UnknownNode(name.to_string()))?;
        debug!(node = name, from = %node.state(), "resetting node state to idle");
        node.set_state(NodeState::Idle, true);
        self.registry.store_node(node);
        Ok(node.state())
    }

    pub fn status(&self) -> ClusterStatus {
        ClusterStatus {
            timestamp: self.ctx.now(),
            nodes: self.nodes.iter().flat_map(|n| n.iter()).cloned().collect(),
            requests: self.requests.iter().cloned().collect(),
            jobs: self.jobs.as_ref().map_or(0, JobList::len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use wattgrid_core::{
        JobInfo, ManualClock, RecordingHooks, ResourceDescriptor, WattgridConfig,
    };

    use crate::registry::MemoryRegistry;

    /// A platform whose answers are set by the test.
    #[derive(Default)]
    struct Scripted {
        nodes: Mutex<Option<Vec<NodeInfo>>>,
        jobs: Mutex<Option<Vec<JobInfo>>>,
        failing: Mutex<HashSet<String>>,
        substitutes: Mutex<HashMap<String, String>>,
        commands: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn set_nodes(&self, nodes: Option<Vec<NodeInfo>>) {
            *self.nodes.lock().unwrap() = nodes;
        }

        fn set_jobs(&self, jobs: Option<Vec<JobInfo>>) {
            *self.jobs.lock().unwrap() = jobs;
        }

        fn command(&self, what: &str, node: &str) -> anyhow::Result<String> {
            self.commands.lock().unwrap().push(format!("{what} {node}"));
            if self.failing.lock().unwrap().contains(node) {
                anyhow::bail!("ipmi timeout");
            }
            Ok(self
                .substitutes
                .lock()
                .unwrap()
                .get(node)
                .cloned()
                .unwrap_or_else(|| node.to_string()))
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl PlatformSource for Scripted {
        fn node_inventory(&self) -> Option<Vec<NodeInfo>> {
            self.nodes.lock().unwrap().clone()
        }

        fn job_inventory(&self) -> Option<Vec<JobInfo>> {
            self.jobs.lock().unwrap().clone()
        }
    }

    impl PowerController for Scripted {
        fn power_on(&self, node: &str) -> anyhow::Result<String> {
            self.command("on", node)
        }

        fn power_off(&self, node: &str) -> anyhow::Result<String> {
            self.command("off", node)
        }
    }

    struct Harness {
        daemon: Daemon,
        platform: Arc<Scripted>,
        clock: Arc<ManualClock>,
        hooks: Arc<RecordingHooks>,
    }

    fn harness_with(config: WattgridConfig, registry: MemoryRegistry) -> Harness {
        let clock = Arc::new(ManualClock::new(1000));
        let hooks = Arc::new(RecordingHooks::new());
        let platform = Arc::new(Scripted::default());
        let ctx = Context::new(config, clock.clone(), hooks.clone());
        let daemon = Daemon::new(ctx, platform.clone(), platform.clone(), Box::new(registry)).unwrap();
        Harness {
            daemon,
            platform,
            clock,
            hooks,
        }
    }

    fn harness() -> Harness {
        harness_with(WattgridConfig::default(), MemoryRegistry::new())
    }

    fn idle(name: &str) -> NodeInfo {
        NodeInfo::new(name, 4.0, 8192.0)
    }

    fn off(name: &str) -> NodeInfo {
        idle(name).with_state(NodeState::Off)
    }

    fn slots(n: f64) -> ResourceRequirement {
        ResourceRequirement::single(ResourceDescriptor::new(Some(n), None))
    }

    #[test]
    fn first_monitoring_seeds_registered_hosts() {
        let mut registry = MemoryRegistry::new();
        registry.enable_host("wn9", true);
        let mut h = harness_with(WattgridConfig::default(), registry);
        h.platform.set_nodes(Some(vec![idle("wn0")]));

        h.daemon.monitor_nodes();
        let nodes = h.daemon.nodes().unwrap();
        assert_eq!(nodes.names(), vec!["wn0", "wn9"]);
        assert_eq!(nodes.get("wn9").unwrap().state(), NodeState::Unknown);
    }

    #[test]
    fn unreported_hosts_are_seeded_from_their_last_observation() {
        let ctx = Context::new(
            WattgridConfig::default(),
            Arc::new(ManualClock::new(0)),
            Arc::new(RecordingHooks::new()),
        );
        let mut registry = MemoryRegistry::new();
        registry.store_node(&Node::from_info(&off("wn9"), ctx));
        registry.enable_host("wn8", true);
        let mut h = harness_with(WattgridConfig::default(), registry);
        h.platform.set_nodes(Some(vec![idle("wn0")]));

        h.daemon.monitor_nodes();
        let seen = h.daemon.node("wn9").unwrap();
        assert_eq!(seen.state(), NodeState::Unknown);
        assert_eq!(seen.slots_total, 4.0);
        assert_eq!(seen.memory_total, 8192.0);
        let never_seen = h.daemon.node("wn8").unwrap();
        assert_eq!(never_seen.state(), NodeState::Unknown);
        assert_eq!(never_seen.slots_total, -1.0);
    }

    #[test]
    fn nodes_appear_and_disappear() {
        let mut h = harness();
        h.platform.set_nodes(Some(vec![idle("wn0")]));
        h.daemon.monitor_nodes();

        h.platform.set_nodes(Some(vec![idle("wn1")]));
        h.daemon.monitor_nodes();
        assert_eq!(h.daemon.node("wn0").unwrap().state(), NodeState::Unknown);
        assert_eq!(h.daemon.node("wn1").unwrap().state(), NodeState::Idle);
    }

    #[test]
    fn missing_inventory_is_tolerated_within_grace() {
        let mut h = harness();
        h.platform.set_nodes(Some(vec![idle("wn0")]));
        h.daemon.monitor_nodes();

        h.platform.set_nodes(None);
        h.clock.advance(60);
        h.daemon.monitor_nodes();
        assert_eq!(h.daemon.node("wn0").unwrap().state(), NodeState::Idle);

        h.clock.advance(120);
        h.daemon.monitor_nodes();
        assert_eq!(h.daemon.node("wn0").unwrap().state(), NodeState::Unknown);
    }

    #[test]
    fn request_on_idle_node_is_served() {
        let mut h = harness();
        h.platform.set_nodes(Some(vec![idle("wn0")]));
        h.daemon.monitor_nodes();

        let id = h.daemon.request(slots(2.0)).unwrap();
        assert!(h.daemon.request_in_queue(id));
        h.daemon.schedule();

        assert_eq!(h.daemon.requests().get(id).unwrap().state(), RequestState::Served);
        assert!(!h.daemon.request_in_queue(id));
        assert_eq!(h.daemon.node("wn0").unwrap().slots_free, 4.0);
        assert!(h.platform.commands().is_empty());
    }

    #[test]
    fn passes_without_fresh_inventory_do_not_book_twice() {
        let mut h = harness();
        h.platform.set_nodes(Some(vec![idle("wn0")]));
        h.daemon.monitor_nodes();
        let first = h.daemon.request(slots(2.0)).unwrap();
        h.daemon.schedule();
        assert_eq!(h.daemon.requests().get(first).unwrap().state(), RequestState::Served);

        h.platform.set_nodes(None);
        h.clock.advance(5);
        h.daemon.monitor_nodes();
        h.daemon.schedule();
        assert_eq!(h.daemon.node("wn0").unwrap().slots_free, 4.0);

        let second = h.daemon.request(slots(2.0)).unwrap();
        h.daemon.schedule();
        assert_eq!(h.daemon.requests().get(second).unwrap().state(), RequestState::Served);
        assert_eq!(h.daemon.node("wn0").unwrap().slots_free, 4.0);
        assert!(h.platform.commands().is_empty());
    }

    #[test]
    fn request_on_off_node_powers_it_on() {
        let mut h = harness();
        h.platform.set_nodes(Some(vec![off("wn0")]));
        h.daemon.monitor_nodes();

        let id = h.daemon.request(slots(2.0)).unwrap();
        h.daemon.schedule();
        assert_eq!(h.daemon.requests().get(id).unwrap().state(), RequestState::Attended);
        assert_eq!(h.platform.commands(), vec!["on wn0"]);
        assert_eq!(h.daemon.node("wn0").unwrap().state(), NodeState::PowOn);

        h.clock.advance(10);
        h.platform.set_nodes(Some(vec![idle("wn0")]));
        h.daemon.monitor_nodes();
        assert_eq!(h.daemon.node("wn0").unwrap().state(), NodeState::Idle);

        h.daemon.schedule();
        assert_eq!(h.daemon.requests().get(id).unwrap().state(), RequestState::Served);
    }

    #[test]
    fn node_stuck_powering_on_becomes_off_err() {
        let mut h = harness();
        h.platform.set_nodes(Some(vec![off("wn0")]));
        h.daemon.monitor_nodes();
        h.daemon.power_on("wn0", false).unwrap();

        h.clock.advance(301);
        h.daemon.monitor_nodes();
        let node = h.daemon.node("wn0").unwrap();
        assert_eq!(node.state(), NodeState::OffErr);
        assert_eq!(node.power_on_failures, 1);

        h.daemon.recover_nodes();
        assert_eq!(h.daemon.node("wn0").unwrap().state(), NodeState::Off);
    }

    #[test]
    fn failed_power_on_marks_off_err() {
        let mut h = harness();
        h.platform.set_nodes(Some(vec![off("wn0")]));
        h.platform.failing.lock().unwrap().insert("wn0".into());
        h.daemon.monitor_nodes();

        let err = h.daemon.power_on("wn0", false).unwrap_err();
        assert!(matches!(err, DaemonError::PowerFailed { .. }));
        assert_eq!(h.daemon.node("wn0").unwrap().state(), NodeState::OffErr);
        assert_eq!(h.hooks.kinds(), vec!["pre_poweron", "post_poweron", "offerr"]);
    }

    #[test]
    fn power_on_is_rekeyed_onto_the_resolved_node() {
        let mut h = harness();
        h.platform.set_nodes(Some(vec![off("wn0"), off("wn1")]));
        h.platform
            .substitutes
            .lock()
            .unwrap()
            .insert("wn0".into(), "wn1".into());
        h.daemon.monitor_nodes();

        assert_eq!(h.daemon.power_on("wn0", false).unwrap(), "wn1");
        assert_eq!(h.daemon.node("wn0").unwrap().state(), NodeState::Off);
        assert_eq!(h.daemon.node("wn1").unwrap().state(), NodeState::PowOn);
    }

    #[test]
    fn disabled_nodes_need_force() {
        let mut config = WattgridConfig::default();
        config.general.disabled_hosts = vec!["wn0".into()];
        let mut h = harness_with(config, MemoryRegistry::new());
        h.platform.set_nodes(Some(vec![off("wn0")]));
        h.daemon.monitor_nodes();

        assert!(matches!(h.daemon.power_on("wn0", false), Err(DaemonError::Disabled(_))));
        assert_eq!(h.daemon.power_on("wn0", true).unwrap(), "wn0");
        assert!(matches!(h.daemon.power_on("wn7", true), Err(DaemonError::UnknownNode(_))));
    }

    #[test]
    fn enable_host_updates_the_node() {
        let mut h = harness();
        h.platform.set_nodes(Some(vec![idle("wn0")]));
        h.daemon.monitor_nodes();

        h.daemon.enable_host("wn0", false).unwrap();
        assert!(!h.daemon.node("wn0").unwrap().enabled);
        h.daemon.monitor_nodes();
        assert!(!h.daemon.node("wn0").unwrap().enabled);
        assert!(h.daemon.enable_host("nope", true).is_err());
    }

    #[test]
    fn reset_forces_idle() {
        let mut h = harness();
        h.platform.set_nodes(Some(vec![off("wn0")]));
        h.platform.failing.lock().unwrap().insert("wn0".into());
        h.daemon.monitor_nodes();
        let _ = h.daemon.power_on("wn0", false);

        assert_eq!(h.daemon.reset_node_state("wn0").unwrap(), NodeState::Idle);
    }

    #[test]
    fn unknown_node_recovers_to_its_last_recorded_state() {
        let mut h = harness();
        h.platform.set_nodes(Some(vec![idle("wn0")]));
        h.daemon.monitor_nodes();
        h.platform.set_nodes(Some(vec![]));
        h.daemon.monitor_nodes();
        assert_eq!(h.daemon.node("wn0").unwrap().state(), NodeState::Unknown);

        assert_eq!(h.daemon.recover_node("wn0").unwrap(), NodeState::Idle);
        assert!(matches!(
            h.daemon.recover_node("wn0"),
            Err(DaemonError::Core(CoreError::NotRecoverable { .. }))
        ));
    }

    #[test]
    fn invalid_constraint_is_rejected() {
        let mut h = harness();
        let mut requirement = slots(1.0);
        requirement
            .resources
            .constraints
            .push(wattgrid_core::Constraint::lenient("arch == "));
        assert!(h.daemon.request(requirement).is_err());
        assert!(h.daemon.requests().is_empty());
    }

    #[test]
    fn served_requests_are_purged_after_cooldown() {
        let mut h = harness();
        h.platform.set_nodes(Some(vec![idle("wn0")]));
        h.daemon.monitor_nodes();
        let id = h.daemon.request(slots(1.0)).unwrap();
        h.daemon.schedule();

        h.clock.advance(120);
        h.daemon.schedule();
        assert!(h.daemon.requests().contains(id));
        h.clock.advance(1);
        h.daemon.schedule();
        assert!(!h.daemon.requests().contains(id));
    }

    #[test]
    fn vanished_jobs_are_marked_and_purged() {
        let mut h = harness();
        let job = JobInfo::new("job.1", slots(1.0), RequestState::Pending);
        h.platform.set_jobs(Some(vec![job]));
        h.daemon.monitor_jobs();
        assert_eq!(h.daemon.jobs().unwrap().len(), 1);

        h.platform.set_jobs(Some(vec![]));
        h.daemon.monitor_jobs();
        let tracked = h.daemon.jobs().unwrap().get("job.1").unwrap();
        assert_eq!(tracked.state(), RequestState::Disappeared);

        h.clock.advance(121);
        h.daemon.monitor_jobs();
        assert!(h.daemon.jobs().unwrap().is_empty());
    }

    #[test]
    fn step_runs_due_tasks() {
        let mut h = harness();
        h.platform.set_nodes(Some(vec![idle("wn0")]));
        h.daemon.step();
        assert!(h.daemon.nodes().is_some());

        h.platform.set_nodes(Some(vec![idle("wn0"), idle("wn1")]));
        h.clock.advance(4);
        h.daemon.step();
        assert!(h.daemon.node("wn1").is_none());
        h.clock.advance(1);
        h.daemon.step();
        assert!(h.daemon.node("wn1").is_some());
    }

    #[test]
    fn status_lists_nodes_and_requests() {
        let mut h = harness();
        h.platform.set_nodes(Some(vec![idle("wn0")]));
        h.daemon.monitor_nodes();
        h.daemon.request(slots(1.0)).unwrap();

        let status = h.daemon.status();
        assert_eq!(status.nodes.len(), 1);
        assert_eq!(status.requests.len(), 1);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["nodes"][0]["name"], "wn0");
    }
}
