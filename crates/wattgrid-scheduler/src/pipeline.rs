use tracing::{error, info};
use wattgrid_core::{Context, RequestQueue};

use crate::candidates::Candidates;
use crate::error::{SchedulerError, SchedulerResult};
use crate::free_capacity::FreeCapacity;
use crate::idle::IdleOff;
use crate::matcher::RequestMatcher;
use crate::monitoring::MonitoringInfo;
use crate::reconsider::ReconsiderJobs;

/// One stage of a scheduling pass.
///
/// Policies run in order and share the queue, the snapshot, and the
/// candidate sets; later policies see what earlier ones decided.
pub trait SchedulerPolicy: Send {
    fn name(&self) -> &'static str;

    fn schedule(
        &mut self,
        requests: &mut RequestQueue,
        monitoring: &mut MonitoringInfo,
        candidates: &mut Candidates,
    ) -> SchedulerResult<()>;
}

/// Build a policy from its configuration name.
pub fn build_policy(name: &str, ctx: &Context) -> SchedulerResult<Box<dyn SchedulerPolicy>> {
    let policy: Box<dyn SchedulerPolicy> = match name {
        RequestMatcher::NAME => Box::new(RequestMatcher::new(ctx.clone())),
        ReconsiderJobs::NAME => Box::new(ReconsiderJobs::new(ctx.clone())),
        IdleOff::NAME => Box::new(IdleOff::new(ctx.clone())),
        FreeCapacity::NAME => Box::new(FreeCapacity::new(ctx.clone())),
        other => return Err(SchedulerError::UnknownPolicy(other.to_string())),
    };
    Ok(policy)
}

/// The ordered list of policies run every scheduling pass.
pub struct Pipeline {
    policies: Vec<Box<dyn SchedulerPolicy>>,
}

impl Pipeline {
    pub fn new(policies: Vec<Box<dyn SchedulerPolicy>>) -> Self {
        Self { policies }
    }

    /// Build the policies listed in `scheduling.policies`, in that order.
    pub fn from_config(ctx: &Context) -> SchedulerResult<Self> {
        let policies = ctx
            .config
            .scheduling
            .policies
            .iter()
            .map(|name| build_policy(name, ctx))
            .collect::<SchedulerResult<Vec<_>>>()?;

        info!(policies = ?ctx.config.scheduling.policies, "scheduler pipeline ready");
        Ok(Self::new(policies))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.policies.iter().map(|p| p.name()).collect()
    }

    /// Run every policy once. A failing policy is logged and skipped.
    pub fn run(&mut self, requests: &mut RequestQueue, monitoring: &mut MonitoringInfo) -> Candidates {
        let mut candidates = Candidates::new();
        for policy in &mut self.policies {
            if let Err(e) = policy.schedule(requests, monitoring, &mut candidates) {
                error!(policy = policy.name(), error = %e, "scheduler policy failed");
            }
        }
        candidates
    }
}
