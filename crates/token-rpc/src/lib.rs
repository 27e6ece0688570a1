//! # Token RPC - Cross-Service Access-Token Validation
//!
//! Request/reply RPC layered over the asynchronous queue transport, used by
//! the TaskMesh services to validate access tokens across service
//! boundaries: a caller publishes the token onto the request queue and
//! awaits a correlated reply from the auth worker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐           ┌─────────────────┐
//! │  task service   │           │  auth service   │
//! │                 │           │                 │
//! │ TokenValidator  │           │    RpcWorker    │
//! │       │         │           │        ▲        │
//! │   RpcClient     │           │        │        │
//! └───────┼─────────┘           └────────┼────────┘
//!         │ token_check_queue            │
//!         └──────────────▶ broker ───────┘
//!         ┌────────────── broker ◀───────┐
//!         ▼ amq.gen-… (exclusive)        │ reply-to
//! ┌───────┼─────────┐                    │
//! │  ReplyListener  │        reply: correlation-id + user id
//! │       │         │
//! │ PendingRegistry │
//! └─────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - One outstanding call per correlation id; ids are fresh per call.
//! - A call resolves exactly once: reply, timeout, or cancellation,
//!   whichever acts first; the others are no-ops.
//! - Late, duplicate, and unknown-id replies are dropped harmlessly.
//! - The worker acknowledges every request exactly once, success or
//!   failure, and never crashes its consume loop on a bad request.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

use std::time::Duration;

pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod pending;
pub mod validator;
pub mod worker;

// Re-export main types
pub use client::RpcClient;
pub use config::{ConfigError, ReconnectConfig, RpcConfig};
pub use correlation::CorrelationId;
pub use error::{ProcessingError, RpcError};
pub use pending::{CallStats, PendingCallRegistry};
pub use validator::{TokenValidator, UserId};
pub use worker::{InMemoryTokenStore, RpcWorker, TokenStore};

/// Well-known queue the auth worker serves token checks on.
pub const TOKEN_CHECK_QUEUE: &str = "token_check_queue";

/// Default deadline for a single RPC call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Default unacknowledged-delivery bound per worker.
pub const DEFAULT_PREFETCH: usize = 1;
