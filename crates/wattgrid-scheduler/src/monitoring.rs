//! The view of the cluster a scheduling pass works on.

use wattgrid_core::{JobList, NodeList};

/// Node and job inventories with the time each was taken.
///
/// `nodes` is a private copy: policies allocate capacity on it freely.
/// `jobs` is the daemon's own tracker list, lent for the pass.
#[derive(Debug, Clone, Default)]
pub struct MonitoringInfo {
    pub nodes: NodeList,
    pub timestamp_nodes: u64,
    pub jobs: Option<JobList>,
    pub timestamp_jobs: u64,
}

impl MonitoringInfo {
    pub fn new(nodes: NodeList, timestamp_nodes: u64, jobs: Option<JobList>, timestamp_jobs: u64) -> Self {
        Self {
            nodes,
            timestamp_nodes,
            jobs,
            timestamp_jobs,
        }
    }
}
