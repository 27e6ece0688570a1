//! RPC error taxonomy.
//!
//! Client-side failures surface synchronously from `RpcClient::call`;
//! worker-side failures are contained in the worker and logged, never
//! propagated into its consume loop.

use crate::config::ConfigError;
use crate::correlation::CorrelationId;
use shared_queue::QueueError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to RPC callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The client is not connected to the broker.
    #[error("not connected to the broker")]
    NotConnected,

    /// The connection dropped before a reply arrived.
    #[error("connection lost before a reply arrived")]
    ConnectionLost,

    /// No reply arrived within the deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// A correlation id collided with an outstanding call.
    ///
    /// Ids are freshly generated per call, so this indicates an
    /// id-generation bug and is surfaced loudly rather than overwriting
    /// the in-flight call.
    #[error("correlation id already in flight: {0}")]
    DuplicateCorrelation(CorrelationId),

    /// The call was abandoned because the client is shutting down.
    #[error("call cancelled by shutdown")]
    Cancelled,

    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A transport-level failure.
    #[error("transport failure: {0}")]
    Transport(#[from] QueueError),
}

/// Worker-side failure to compute a reply.
///
/// Recovered locally: the worker logs it, sends no reply, and acknowledges
/// the request so the consume loop keeps running.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// The request body was not valid UTF-8.
    #[error("request body is not valid UTF-8")]
    InvalidPayload,

    /// No principal is associated with the token.
    #[error("no principal associated with the token")]
    UnknownToken,

    /// The backing store failed.
    #[error("backing store failure: {0}")]
    Store(String),
}
