//! The daemon driving a simulated data center, second by second.

use std::sync::Arc;

use wattd::{Daemon, MemoryRegistry};
use wattgrid_core::{
    Clock, Context, ManualClock, NodeState, RecordingHooks, RequestState, ResourceDescriptor, ResourceRequirement,
    WattgridConfig,
};
use wattgrid_sim::{DataCenter, NodePool, Power, SimNode};

struct World {
    daemon: Daemon,
    dc: DataCenter,
    clock: Arc<ManualClock>,
    hooks: Arc<RecordingHooks>,
}

impl World {
    fn new(config: WattgridConfig, nodes: Vec<SimNode>) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let hooks = Arc::new(RecordingHooks::new());
        let mut pool = NodePool::new();
        for node in nodes {
            pool.add(node).unwrap();
        }
        let dc = DataCenter::new(pool, clock.clone());
        let ctx = Context::new(config, clock.clone(), hooks.clone());
        let daemon = Daemon::new(
            ctx,
            Arc::new(dc.clone()),
            Arc::new(dc.clone()),
            Box::new(MemoryRegistry::new()),
        )
        .unwrap();
        Self {
            daemon,
            dc,
            clock,
            hooks,
        }
    }

    /// Advance the world and the daemon up to and including second `t`.
    fn run_to(&mut self, t: u64) {
        while self.clock.now() <= t {
            self.dc.advance();
            self.daemon.step();
            self.clock.advance(1);
        }
    }

    fn state(&self, node: &str) -> NodeState {
        self.daemon.node(node).unwrap().state()
    }
}

fn slots(n: f64) -> ResourceRequirement {
    ResourceRequirement::single(ResourceDescriptor::new(Some(n), None))
}

#[test]
fn off_node_is_powered_on_for_a_request_and_off_when_idle() {
    let mut config = WattgridConfig::default();
    config.scheduling.idle_time = 60;
    let mut w = World::new(config, vec![SimNode::new("wn0", 4.0, 8192.0)]);

    let id = w.daemon.request(slots(2.0)).unwrap();
    w.run_to(0);
    assert_eq!(w.daemon.requests().get(id).unwrap().state(), RequestState::Attended);
    assert_eq!(w.state("wn0"), NodeState::PowOn);

    w.run_to(10);
    assert_eq!(w.state("wn0"), NodeState::Idle);
    assert_eq!(w.daemon.requests().get(id).unwrap().state(), RequestState::Served);

    w.run_to(100);
    assert_eq!(w.state("wn0"), NodeState::Off);
    assert_eq!(w.dc.node("wn0").unwrap().power, Power::Off);

    let kinds = w.hooks.kinds();
    for expected in ["request", "pre_poweron", "post_poweron", "poweredon", "pre_poweroff", "poweredoff"] {
        assert!(kinds.contains(&expected), "missing {expected} in {kinds:?}");
    }
}

#[test]
fn later_request_does_not_jump_the_queue() {
    let mut w = World::new(
        WattgridConfig::default(),
        vec![
            SimNode::new("wn0", 1.0, 8192.0).powered_on(),
            SimNode::new("wn1", 4.0, 8192.0),
        ],
    );
    w.daemon.monitor_nodes();

    let first = w.daemon.request(slots(2.0)).unwrap();
    let second = w.daemon.request(slots(1.0)).unwrap();
    w.daemon.schedule();

    assert_eq!(w.daemon.requests().get(first).unwrap().state(), RequestState::Attended);
    assert_eq!(w.daemon.requests().get(second).unwrap().state(), RequestState::Blocked);
    assert_eq!(w.state("wn1"), NodeState::PowOn);
}

#[test]
fn failed_power_on_is_recovered_and_retried() {
    let mut config = WattgridConfig::default();
    config.monitoring.max_wait_poweron = 30;
    let mut w = World::new(config, vec![SimNode::new("wn0", 4.0, 8192.0).with_failing_power_ons(1)]);

    w.daemon.request(slots(1.0)).unwrap();
    w.run_to(29);
    assert_eq!(w.state("wn0"), NodeState::PowOn);

    w.run_to(30);
    let node = w.daemon.node("wn0").unwrap();
    assert_eq!(node.state(), NodeState::Off);
    assert_eq!(node.power_on_failures, 1);
    assert!(w.hooks.kinds().contains(&"offerr"));

    let retry = w.daemon.request(slots(1.0)).unwrap();
    w.run_to(60);
    assert_eq!(w.state("wn0"), NodeState::Idle);
    assert_eq!(w.daemon.requests().get(retry).unwrap().state(), RequestState::Served);
}

#[test]
fn disabled_host_is_left_alone() {
    let mut config = WattgridConfig::default();
    config.scheduling.idle_time = 10;
    config.general.disabled_hosts = vec!["wn0".into()];
    let mut w = World::new(
        config,
        vec![
            SimNode::new("wn0", 4.0, 8192.0).powered_on(),
            SimNode::new("wn1", 4.0, 8192.0).powered_on(),
        ],
    );

    w.run_to(60);
    assert_eq!(w.state("wn0"), NodeState::Idle);
    assert_eq!(w.state("wn1"), NodeState::Off);
}

#[test]
fn node_missing_from_inventory_becomes_unknown() {
    let mut w = World::new(WattgridConfig::default(), vec![SimNode::new("wn0", 4.0, 8192.0).powered_on()]);
    w.run_to(0);
    assert_eq!(w.state("wn0"), NodeState::Idle);

    w.dc.set_available(false);
    w.run_to(200);
    assert_eq!(w.state("wn0"), NodeState::Unknown);

    w.dc.set_available(true);
    w.run_to(205);
    assert_eq!(w.state("wn0"), NodeState::Idle);
}
