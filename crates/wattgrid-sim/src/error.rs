//! Simulator error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("node not found: {0}")]
    UnknownNode(String),

    #[error("node already exists: {0}")]
    DuplicateNode(String),

    #[error("job already submitted: {0}")]
    DuplicateJob(String),

    #[error("cannot power on node {0} while it is powering off")]
    PoweringOff(String),

    #[error("invalid scenario: {0}")]
    Scenario(String),
}

pub type SimResult<T> = Result<T, SimError>;
