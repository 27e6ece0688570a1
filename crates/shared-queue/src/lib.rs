//! # Shared Queue - Message-Queue Transport for Inter-Service RPC
//!
//! Provides the broker primitives the TaskMesh services use to talk to each
//! other: named queues, client-private exclusive queues, publish with
//! `correlation-id`/`reply-to` properties, and consumers with a bounded
//! prefetch window and per-delivery acknowledgment.
//!
//! ## Topology
//!
//! ```text
//! ┌──────────────┐                         ┌──────────────┐
//! │  Service A   │   publish(queue, msg)   │  Service B   │
//! │              │ ──────────┐             │              │
//! └──────────────┘           │             └──────────────┘
//!                            ▼                     ↑
//!                      ┌──────────────┐            │
//!                      │ QueueBroker  │ ───────────┘
//!                      │              │   consume(queue, prefetch)
//!                      └──────────────┘
//! ```
//!
//! ## Semantics
//!
//! - **Exclusive queues** are auto-named, owned by the declaring connection,
//!   and deleted when that connection closes.
//! - **Prefetch** bounds the number of unacknowledged deliveries a consumer
//!   may hold; `0` means unbounded.
//! - **Unroutable messages** (no queue bound to the routing key) are dropped,
//!   matching default-exchange behavior without the mandatory flag.
//!
//! The broker here is in-memory, suitable for single-process deployments and
//! tests; a networked AMQP implementation would fill the same `Connection`
//! surface.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod connection;
pub mod error;
pub mod message;
pub mod queue;

// Re-export main types
pub use connection::{Connection, ConnectionState, QueueBroker};
pub use error::QueueError;
pub use message::{Delivery, Message};
pub use queue::Consumer;

/// Maximum messages buffered per queue before publishes are rejected.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Name prefix for auto-named exclusive queues.
pub const EXCLUSIVE_QUEUE_PREFIX: &str = "amq.gen-";
