//! Errors reported by the scheduling engine.
use crate::request::{CorrelationId, RequestId};
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure a caller or a ticket can observe.
///
/// Errors are cloneable because one backend failure is delivered to every
/// member of the failed batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No loaded, servable instance for the target model/version.
    #[error("model {0} is not available")]
    ModelUnavailable(String),

    /// The sequence was ended by its idle timeout.
    #[error("sequence {0} timed out")]
    SequenceTimeout(CorrelationId),

    /// The request violates sequence routing rules.
    #[error("sequence {correlation_id} conflict: {reason}")]
    SequenceConflict {
        /// Correlation id of the offending sequence
        correlation_id: CorrelationId,
        /// What was violated
        reason: String,
    },

    /// Cancel raced with dispatch and lost.
    #[error("request {0} is already dispatched")]
    AlreadyDispatched(RequestId),

    /// The backend failed the request or its whole batch.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The model's waiting area is full.
    #[error("request queue full: capacity {capacity}")]
    QueueOverflow {
        /// Configured maximum queue size
        capacity: usize,
    },

    /// The request was cancelled before dispatch.
    #[error("request {0} was cancelled")]
    Cancelled(RequestId),

    /// The request's deadline passed before it was batched.
    #[error("request {0} missed its deadline")]
    DeadlineExceeded(RequestId),

    /// The scheduler does not track this request.
    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    /// The request is malformed for the target model.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The model configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No instance of the model could be initialized.
    #[error("model load failed: {0}")]
    LoadFailed(String),

    /// The scheduler went away before answering.
    #[error("scheduler disconnected")]
    Disconnected,
}
