//! Error types for the cluster model.

use thiserror::Error;

use crate::expr::ExprError;
use crate::node::NodeState;
use crate::request::RequestId;

/// Result type alias for cluster model operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while manipulating nodes, requests, and jobs.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("request {0} is already queued")]
    DuplicateId(RequestId),

    #[error("job {0} is already tracked")]
    DuplicateJob(String),

    #[error("request {0} does not track a job")]
    NotAJob(RequestId),

    #[error("node {node} cannot be recovered from state {state}")]
    NotRecoverable { node: String, state: NodeState },

    #[error("no prior state is known for node {0}")]
    NoPriorState(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("invalid constraint: {0}")]
    Expression(#[from] ExprError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
