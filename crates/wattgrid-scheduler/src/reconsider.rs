use tracing::debug;
use wattgrid_core::{Context, Request, RequestQueue, RequestState};

use crate::candidates::Candidates;
use crate::error::SchedulerResult;
use crate::monitoring::MonitoringInfo;
use crate::pipeline::SchedulerPolicy;

/// Re-queues jobs the batch system has kept pending for longer than
/// `reconsider_job_time`, unless a request for the job is still in
/// flight or was served recently.
pub struct ReconsiderJobs {
    ctx: Context,
}

impl ReconsiderJobs {
    pub const NAME: &'static str = "reconsider_jobs";

    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    fn has_live_request(&self, requests: &RequestQueue, job_id: &str, now: u64) -> bool {
        let threshold = self.ctx.config.scheduling.reconsider_job_time;
        requests
            .iter()
            .filter(|r| r.job_id.as_deref() == Some(job_id))
            .any(|r| match r.state() {
                RequestState::Served => now.saturating_sub(r.timestamp_state) < threshold,
                RequestState::Discarded | RequestState::NotServed => false,
                _ => true,
            })
    }
}

impl SchedulerPolicy for ReconsiderJobs {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn schedule(
        &mut self,
        requests: &mut RequestQueue,
        monitoring: &mut MonitoringInfo,
        _candidates: &mut Candidates,
    ) -> SchedulerResult<()> {
        let Some(jobs) = monitoring.jobs.as_mut() else {
            debug!("no job information to reconsider");
            return Ok(());
        };

        let now = self.ctx.now();
        let threshold = self.ctx.config.scheduling.reconsider_job_time;

        for job_id in jobs.ids(Some(RequestState::Pending)) {
            let Some(job) = jobs.get_mut(&job_id) else {
                continue;
            };
            let inactive_since = job.timestamp_state.max(job.timestamp_attended);
            if now.saturating_sub(inactive_since) <= threshold || self.has_live_request(requests, &job_id, now) {
                continue;
            }

            debug!(job = %job_id, since = inactive_since, "job pending for too long, reconsidering it");
            job.set_state(RequestState::Attended);
            let retry =
                Request::new(job.requirement.clone(), self.ctx.clock.clone()).for_job(job_id, job.job_node_ids.clone());
            requests.append(retry)?;
        }
        Ok(())
    }
}
