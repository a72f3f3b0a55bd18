//! A first-in first-out batch system.
//!
//! Jobs are placed strictly in submission order: if the head of the queue
//! does not fit on the nodes that are on, nothing behind it starts either.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info};
use wattgrid_core::{JobInfo, RequestState, ResourceDescriptor, ResourceRequirement};

use crate::error::{SimError, SimResult};
use crate::node::NodePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Finished,
}

/// A job of the simulated workload. Each of its `node_count` parts takes
/// `cores` and `memory` on a different node.
#[derive(Debug, Clone, Serialize)]
pub struct SimJob {
    pub name: String,
    pub cores: f64,
    pub memory: f64,
    pub node_count: u32,
    pub seconds: u64,
    pub state: JobState,
    pub nodes: Vec<String>,
    pub submitted_at: Option<u64>,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

impl SimJob {
    pub fn new(name: impl Into<String>, cores: f64, memory: f64, seconds: u64) -> Self {
        Self {
            name: name.into(),
            cores,
            memory,
            node_count: 1,
            seconds,
            state: JobState::Queued,
            nodes: Vec::new(),
            submitted_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_node_count(mut self, node_count: u32) -> Self {
        self.node_count = node_count.max(1);
        self
    }

    pub fn requirement(&self) -> ResourceRequirement {
        ResourceRequirement::for_nodes(ResourceDescriptor::new(Some(self.cores), Some(self.memory)), self.node_count)
    }

    /// Seconds spent waiting in the queue, once started.
    pub fn wait_time(&self) -> Option<u64> {
        Some(self.started_at?.saturating_sub(self.submitted_at?))
    }

    fn info(&self) -> JobInfo {
        let state = match self.state {
            JobState::Queued => RequestState::Pending,
            _ => RequestState::Served,
        };
        let mut info = JobInfo::new(self.name.clone(), self.requirement(), state);
        info.node_ids.clone_from(&self.nodes);
        info
    }
}

#[derive(Debug, Default)]
pub struct FifoLrms {
    jobs: HashMap<String, SimJob>,
    queue: Vec<String>,
    running: Vec<String>,
    finished: Vec<String>,
}

impl FifoLrms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, mut job: SimJob, now: u64) -> SimResult<()> {
        if self.jobs.contains_key(&job.name) {
            return Err(SimError::DuplicateJob(job.name));
        }
        debug!(job = %job.name, cores = job.cores, nodes = job.node_count, "job submitted");
        job.state = JobState::Queued;
        job.submitted_at = Some(now);
        self.queue.push(job.name.clone());
        self.jobs.insert(job.name.clone(), job);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SimJob> {
        self.jobs.get(name)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Finished jobs in completion order.
    pub fn finished(&self) -> Vec<&SimJob> {
        self.finished.iter().filter_map(|n| self.jobs.get(n)).collect()
    }

    /// Jobs still queued or running, as the batch system reports them.
    pub fn job_infos(&self) -> Vec<JobInfo> {
        self.queue
            .iter()
            .chain(&self.running)
            .filter_map(|n| self.jobs.get(n))
            .map(SimJob::info)
            .collect()
    }

    /// Finish jobs that ran their time, start what fits.
    pub fn lifecycle(&mut self, pool: &mut NodePool, now: u64) {
        self.finish_jobs(pool, now);
        self.start_jobs(pool, now);
    }

    fn finish_jobs(&mut self, pool: &mut NodePool, now: u64) {
        let mut still_running = Vec::new();
        for name in std::mem::take(&mut self.running) {
            let Some(job) = self.jobs.get_mut(&name) else {
                continue;
            };
            let done = job.started_at.is_some_and(|t| now.saturating_sub(t) >= job.seconds);
            if !done {
                still_running.push(name);
                continue;
            }

            for node in &job.nodes {
                if let Ok(n) = pool.get_mut(node) {
                    n.release(job.cores, job.memory);
                }
            }
            job.state = JobState::Finished;
            job.finished_at = Some(now);
            info!(job = %name, "job finished");
            self.finished.push(name);
        }
        self.running = still_running;
    }

    fn start_jobs(&mut self, pool: &mut NodePool, now: u64) {
        while let Some(name) = self.queue.first().cloned() {
            let Some(job) = self.jobs.get_mut(&name) else {
                self.queue.remove(0);
                continue;
            };
            let Some(nodes) = place(pool, job.cores, job.memory, job.node_count) else {
                return;
            };

            for node in &nodes {
                if let Ok(n) = pool.get_mut(node) {
                    n.assign(job.cores, job.memory);
                }
            }
            info!(job = %name, nodes = ?nodes, "job started");
            job.nodes = nodes;
            job.state = JobState::Running;
            job.started_at = Some(now);
            self.queue.remove(0);
            self.running.push(name);
        }
    }
}

/// First fit, one part per node.
fn place(pool: &NodePool, cores: f64, memory: f64, count: u32) -> Option<Vec<String>> {
    let nodes: Vec<String> = pool
        .iter()
        .filter(|n| n.fits(cores, memory))
        .take(count as usize)
        .map(|n| n.name.clone())
        .collect();
    (nodes.len() == count as usize).then_some(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::SimNode;

    fn pool(on: &[(&str, f64)]) -> NodePool {
        let mut pool = NodePool::new();
        for &(name, cores) in on {
            pool.add(SimNode::new(name, cores, 4096.0).powered_on()).unwrap();
        }
        pool
    }

    #[test]
    fn jobs_run_for_their_duration() {
        let mut pool = pool(&[("wn0", 4.0)]);
        let mut lrms = FifoLrms::new();
        lrms.submit(SimJob::new("j1", 2.0, 1024.0, 30), 0).unwrap();

        lrms.lifecycle(&mut pool, 1);
        assert_eq!(lrms.running(), 1);
        assert_eq!(pool.get("wn0").unwrap().cores_free, 2.0);
        assert_eq!(lrms.job_infos()[0].state, RequestState::Served);

        lrms.lifecycle(&mut pool, 30);
        assert_eq!(lrms.running(), 1);
        lrms.lifecycle(&mut pool, 31);
        assert_eq!(lrms.running(), 0);
        assert_eq!(pool.get("wn0").unwrap().cores_free, 4.0);

        let done = lrms.finished();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].wait_time(), Some(1));
        assert!(lrms.job_infos().is_empty());
    }

    #[test]
    fn head_of_queue_blocks_the_rest() {
        let mut pool = pool(&[("wn0", 2.0)]);
        let mut lrms = FifoLrms::new();
        lrms.submit(SimJob::new("big", 4.0, 1.0, 10), 0).unwrap();
        lrms.submit(SimJob::new("small", 1.0, 1.0, 10), 0).unwrap();

        lrms.lifecycle(&mut pool, 1);
        assert_eq!(lrms.queued(), 2);
        let infos = lrms.job_infos();
        assert!(infos.iter().all(|j| j.state == RequestState::Pending));
        assert_eq!(infos[0].requirement.resources.slots, Some(4.0));
    }

    #[test]
    fn multi_node_job_takes_distinct_nodes() {
        let mut pool = pool(&[("wn0", 4.0), ("wn1", 4.0)]);
        let mut lrms = FifoLrms::new();
        lrms.submit(SimJob::new("mpi", 1.0, 1.0, 10).with_node_count(2), 0).unwrap();
        lrms.lifecycle(&mut pool, 0);
        assert_eq!(lrms.get("mpi").unwrap().nodes, vec!["wn0", "wn1"]);
        assert_eq!(lrms.job_infos()[0].node_ids, vec!["wn0", "wn1"]);
    }

    #[test]
    fn duplicate_job_names_are_rejected() {
        let mut lrms = FifoLrms::new();
        lrms.submit(SimJob::new("j1", 1.0, 1.0, 10), 0).unwrap();
        assert!(matches!(
            lrms.submit(SimJob::new("j1", 1.0, 1.0, 10), 0),
            Err(SimError::DuplicateJob(_))
        ));
    }
}
