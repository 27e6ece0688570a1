//! Transport error types.

use thiserror::Error;

/// Errors from queue operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The connection has been closed.
    #[error("connection is not open")]
    NotConnected,

    /// No queue with this name has been declared.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// The queue is exclusive to a different connection.
    #[error("queue is exclusive to another connection: {0}")]
    ExclusiveViolation(String),

    /// The queue buffer is full and the publish was rejected.
    #[error("queue is full: {0}")]
    QueueFull(String),
}
