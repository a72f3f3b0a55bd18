//! The simulated data center as the control loop sees it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use tracing::info;
use wattgrid_core::{Clock, JobInfo, NodeInfo, PlatformSource, PowerController};

use crate::error::SimResult;
use crate::lrms::{FifoLrms, SimJob};
use crate::node::{NodePool, SimNode};

#[derive(Debug)]
struct Inner {
    pool: NodePool,
    lrms: FifoLrms,
    available: bool,
    power_commands: u32,
}

/// Node pool plus batch system behind one lock, shared between the daemon
/// (through [`PlatformSource`] and [`PowerController`]) and the driver.
#[derive(Clone)]
pub struct DataCenter {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl DataCenter {
    pub fn new(pool: NodePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                pool,
                lrms: FifoLrms::new(),
                available: true,
                power_commands: 0,
            })),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn submit(&self, job: SimJob) -> SimResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.lrms.submit(job, now)?;
        let Inner { pool, lrms, .. } = &mut *inner;
        lrms.lifecycle(pool, now);
        Ok(())
    }

    pub fn add_node(&self, node: SimNode) -> SimResult<()> {
        self.lock().pool.add(node)
    }

    /// Make the inventories unreadable, as when the batch system is down.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Advance node transitions and the batch system to the current time.
    pub fn advance(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let Inner { pool, lrms, .. } = &mut *inner;
        pool.settle(now);
        lrms.lifecycle(pool, now);
    }

    pub fn node(&self, name: &str) -> SimResult<SimNode> {
        self.lock().pool.get(name).cloned()
    }

    pub fn nodes(&self) -> Vec<SimNode> {
        self.lock().pool.iter().cloned().collect()
    }

    pub fn job(&self, name: &str) -> Option<SimJob> {
        self.lock().lrms.get(name).cloned()
    }

    pub fn finished_jobs(&self) -> Vec<SimJob> {
        self.lock().lrms.finished().into_iter().cloned().collect()
    }

    /// Jobs queued plus jobs running.
    pub fn pending_jobs(&self) -> usize {
        let inner = self.lock();
        inner.lrms.queued() + inner.lrms.running()
    }

    pub fn power_commands(&self) -> u32 {
        self.lock().power_commands
    }
}

impl PlatformSource for DataCenter {
    fn node_inventory(&self) -> Option<Vec<NodeInfo>> {
        let inner = self.lock();
        inner.available.then(|| inner.pool.infos())
    }

    fn job_inventory(&self) -> Option<Vec<JobInfo>> {
        let inner = self.lock();
        inner.available.then(|| inner.lrms.job_infos())
    }

    fn lifecycle(&self) {
        self.advance();
    }
}

impl PowerController for DataCenter {
    fn power_on(&self, node: &str) -> anyhow::Result<String> {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.power_commands += 1;
        let started = inner.pool.get_mut(node)?.power_on(now)?;
        if started {
            info!(node, "simulated power on");
        }
        Ok(node.to_string())
    }

    fn power_off(&self, node: &str) -> anyhow::Result<String> {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.power_commands += 1;
        let n = inner.pool.get_mut(node)?;
        if n.is_busy() {
            return Err(anyhow!("node {node} is running jobs"));
        }
        if n.power_off(now) {
            info!(node, "simulated power off");
        }
        Ok(node.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wattgrid_core::{ManualClock, NodeState, RequestState};

    fn datacenter() -> (DataCenter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let mut pool = NodePool::new();
        pool.add(SimNode::new("wn0", 4.0, 4096.0).with_delays(10, 10)).unwrap();
        pool.add(SimNode::new("wn1", 4.0, 4096.0).powered_on()).unwrap();
        (DataCenter::new(pool, clock.clone()), clock)
    }

    #[test]
    fn reports_inventories_until_unavailable() {
        let (dc, _) = datacenter();
        let nodes = dc.node_inventory().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].state, NodeState::Off);
        assert_eq!(nodes[1].state, NodeState::Idle);

        dc.set_available(false);
        assert!(dc.node_inventory().is_none());
        assert!(dc.job_inventory().is_none());
    }

    #[test]
    fn power_on_completes_after_delay() {
        let (dc, clock) = datacenter();
        assert_eq!(dc.power_on("wn0").unwrap(), "wn0");
        clock.set(10);
        PlatformSource::lifecycle(&dc);
        assert_eq!(dc.node_inventory().unwrap()[0].state, NodeState::Idle);
        assert_eq!(dc.power_commands(), 1);
    }

    #[test]
    fn unknown_node_is_an_error() {
        let (dc, _) = datacenter();
        assert!(dc.power_on("nope").is_err());
        assert!(dc.power_off("nope").is_err());
    }

    #[test]
    fn submitted_job_starts_on_a_free_node() {
        let (dc, _) = datacenter();
        dc.submit(SimJob::new("j1", 2.0, 1024.0, 60)).unwrap();
        let jobs = dc.job_inventory().unwrap();
        assert_eq!(jobs[0].state, RequestState::Served);
        assert_eq!(jobs[0].node_ids, vec!["wn1"]);
        assert!(dc.power_off("wn1").is_err());
    }
}
