//! Periodic task bookkeeping for [`Daemon::step`](crate::Daemon::step).

use tracing::info;
use wattgrid_core::WattgridConfig;

/// A task that runs every `period` seconds, first at `next`. A zero period
/// never runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Periodic {
    period: u64,
    next: u64,
}

impl Periodic {
    pub fn new(period: u64, start: u64) -> Self {
        Self { period, next: start }
    }

    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    /// Whether the task should run at `now`; if so, schedule the next run.
    pub fn due(&mut self, now: u64) -> bool {
        if self.period == 0 || now < self.next {
            return false;
        }
        self.next = now + self.period;
        true
    }

    pub fn next(&self) -> Option<u64> {
        (self.period > 0).then_some(self.next)
    }
}

#[derive(Debug, Clone)]
pub struct Tasks {
    pub nodes: Periodic,
    pub jobs: Periodic,
    /// Jobs are read right after nodes when both share a period.
    pub jobs_with_nodes: bool,
    pub schedule: Periodic,
    pub lifecycle: Periodic,
    pub recovery: Periodic,
}

impl Tasks {
    pub fn from_config(config: &WattgridConfig, start: u64) -> Self {
        let monitoring = &config.monitoring;
        let jobs_period = monitoring.period_monitoring_jobs;
        let jobs_with_nodes = jobs_period > 0 && jobs_period == monitoring.period_monitoring_nodes;

        let jobs = if jobs_period == 0 {
            info!("not monitoring jobs, period_monitoring_jobs is 0");
            Periodic::disabled()
        } else if jobs_with_nodes {
            Periodic::disabled()
        } else {
            Periodic::new(jobs_period, start)
        };

        Self {
            nodes: Periodic::new(monitoring.period_monitoring_nodes, start),
            jobs,
            jobs_with_nodes,
            schedule: Periodic::new(config.scheduling.period_schedule, start),
            lifecycle: Periodic::new(monitoring.period_lifecycle, start),
            recovery: Periodic::new(config.scheduling.period_recovery_nodes, start),
        }
    }

    /// Earliest time any task is due.
    pub fn next_due(&self) -> Option<u64> {
        [self.nodes, self.jobs, self.schedule, self.lifecycle, self.recovery]
            .iter()
            .filter_map(Periodic::next)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_runs_on_schedule() {
        let mut p = Periodic::new(5, 100);
        assert!(!p.due(99));
        assert!(p.due(100));
        assert!(!p.due(104));
        assert!(p.due(105));
        assert_eq!(p.next(), Some(110));
        assert!(!Periodic::disabled().due(1_000));
    }

    #[test]
    fn equal_periods_combine_monitoring() {
        let mut config = WattgridConfig::default();
        config.monitoring.period_monitoring_jobs = config.monitoring.period_monitoring_nodes;
        let tasks = Tasks::from_config(&config, 0);
        assert!(tasks.jobs_with_nodes);
        assert_eq!(tasks.jobs.next(), None);

        config.monitoring.period_monitoring_jobs = 7;
        let tasks = Tasks::from_config(&config, 0);
        assert!(!tasks.jobs_with_nodes);
        assert_eq!(tasks.jobs.next(), Some(0));
    }

    #[test]
    fn next_due_is_the_earliest_task() {
        let mut tasks = Tasks::from_config(&WattgridConfig::default(), 10);
        assert_eq!(tasks.next_due(), Some(10));
        tasks.nodes.due(10);
        tasks.schedule.due(10);
        tasks.lifecycle.due(10);
        tasks.recovery.due(10);
        assert_eq!(tasks.next_due(), Some(15));
    }
}
