//! Traits implemented by the systems that actually do the work.
//!
//! The coordination layer never runs a deployment itself. Workers hand the
//! claimed job's payload to an [`OperationExecutor`], and subscribers hand
//! each delivered message to a [`MessageHandler`].

use async_trait::async_trait;
use thiserror::Error;

use crate::{CancelToken, Message};

/// Failure reported by an executor or message handler.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// Worth another attempt after backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Retrying cannot help; dead-letter immediately.
    #[error("terminal: {0}")]
    Terminal(String),

    /// The worker was asked to stop while the operation was running.
    #[error("cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionError::Terminal(_))
    }
}

/// Runs the long-lived operation described by a job payload.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Name of this executor, for logs.
    fn name(&self) -> &'static str;

    /// Execute the operation. Must be idempotent: a job may run more than
    /// once when a worker loses its lease.
    async fn execute(
        &self,
        payload: &serde_json::Value,
        cancel: CancelToken,
    ) -> std::result::Result<(), ExecutionError>;
}

/// Processes messages delivered on a topic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> std::result::Result<(), ExecutionError>;
}
