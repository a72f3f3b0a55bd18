//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during a scheduling pass.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown scheduler policy: {0}")]
    UnknownPolicy(String),

    #[error("cluster model error: {0}")]
    Core(#[from] wattgrid_core::CoreError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
