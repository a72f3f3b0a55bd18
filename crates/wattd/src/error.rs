//! Daemon error types.

use thiserror::Error;
use wattgrid_core::CoreError;

pub type DaemonResult<T> = Result<T, DaemonError>;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("node is not managed: {0}")]
    UnknownNode(String),

    #[error("node {0} is disabled")]
    Disabled(String),

    #[error("power command for node {node} failed: {reason}")]
    PowerFailed { node: String, reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("configuration error: {0}")]
    Config(String),
}
