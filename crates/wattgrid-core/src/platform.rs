//! Capabilities the control loop needs from the outside world.

use crate::node::NodeInfo;
use crate::request::JobInfo;

/// Source of node and job inventories (the batch system).
///
/// `None` means the inventory could not be read this time; the caller
/// decides how long to tolerate that.
pub trait PlatformSource: Send + Sync {
    fn node_inventory(&self) -> Option<Vec<NodeInfo>>;

    fn job_inventory(&self) -> Option<Vec<JobInfo>>;

    /// Periodic housekeeping hook.
    fn lifecycle(&self) {}
}

/// The mechanism that actually powers nodes on and off.
///
/// On success returns the id of the node that was acted on, which may
/// differ from the one asked for when the platform picks a substitute.
pub trait PowerController: Send + Sync {
    fn power_on(&self, node: &str) -> anyhow::Result<String>;

    fn power_off(&self, node: &str) -> anyhow::Result<String>;

    /// Periodic housekeeping hook.
    fn lifecycle(&self) {}
}
