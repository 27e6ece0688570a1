//! # RPC Worker
//!
//! The answering side of the RPC layer: consumes the well-known request
//! queue, resolves each token against the backing store, and publishes the
//! reply to the request's `reply-to` address under the request's
//! correlation id.
//!
//! ## Per-Message State Machine
//!
//! ```text
//! received ──▶ processing ──▶ { replied | no-reply } ──▶ acknowledged
//! ```
//!
//! Processing produces an explicit `Result`; the consume loop handles it at
//! exactly one point, so a failure can never skip the acknowledgment or
//! crash the loop. On failure the worker sends no reply and the caller runs
//! into its own deadline; an unauthenticated result and a failed lookup are
//! indistinguishable to the caller on purpose.
//!
//! Prefetch bounds the unacknowledged window (default 1: fully sequential
//! per worker). Horizontal scale comes from running more workers against
//! the same queue.

use crate::config::RpcConfig;
use crate::error::{ProcessingError, RpcError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use shared_queue::{Connection, Delivery, Message, QueueBroker};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Backing store the worker resolves tokens against.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Look up the user id associated with an access token.
    async fn user_id_for_token(&self, token: &str) -> Result<u64, ProcessingError>;
}

/// In-memory token store for tests and single-process demos.
#[derive(Default)]
pub struct InMemoryTokenStore {
    tokens: RwLock<HashMap<String, u64>>,
}

impl InMemoryTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a token with a user id.
    pub fn insert(&self, token: impl Into<String>, user_id: u64) {
        self.tokens.write().insert(token.into(), user_id);
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn user_id_for_token(&self, token: &str) -> Result<u64, ProcessingError> {
        self.tokens
            .read()
            .get(token)
            .copied()
            .ok_or(ProcessingError::UnknownToken)
    }
}

/// Worker that serves token-validation requests from the request queue.
pub struct RpcWorker {
    connection: Connection,
    store: Arc<dyn TokenStore>,
    config: RpcConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl RpcWorker {
    /// Connect to the broker and declare the request queue.
    pub fn new(
        broker: &QueueBroker,
        store: Arc<dyn TokenStore>,
        config: RpcConfig,
    ) -> Result<Self, RpcError> {
        config.validate()?;

        let connection = broker.connect();
        connection.declare_queue(&config.request_queue)?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            connection,
            store,
            config,
            shutdown_tx,
        })
    }

    /// Run the consume loop until shutdown or connection loss.
    ///
    /// The loop never exits because of a processing failure. On shutdown
    /// the message in flight is finished (reply and ack) before the loop
    /// returns; the caller then decides when to [`RpcWorker::close`] the
    /// connection.
    pub async fn run(&self) -> Result<(), RpcError> {
        let mut consumer = self
            .connection
            .consume(&self.config.request_queue, self.config.prefetch)?;
        let mut shutdown = self.shutdown_tx.subscribe();

        info!(
            queue = %self.config.request_queue,
            prefetch = self.config.prefetch,
            "[rpc-worker] consuming requests"
        );

        loop {
            tokio::select! {
                delivery = consumer.recv() => {
                    let Some(mut delivery) = delivery else {
                        warn!("[rpc-worker] request queue closed, stopping");
                        break;
                    };
                    self.handle_delivery(&mut delivery).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("[rpc-worker] shutdown signal received, draining");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Process one delivery: compute the outcome, maybe reply, always ack.
    async fn handle_delivery(&self, delivery: &mut Delivery) {
        match self.process(delivery.message()).await {
            Ok(user_id) => self.send_reply(delivery.message(), user_id),
            Err(e) => {
                // No reply on failure; the caller times out and treats the
                // token as unauthenticated.
                warn!(error = %e, "Request processing failed, no reply sent");
            }
        }

        delivery.ack();
    }

    /// Decode the request and resolve the token.
    async fn process(&self, message: &Message) -> Result<String, ProcessingError> {
        let token =
            std::str::from_utf8(&message.body).map_err(|_| ProcessingError::InvalidPayload)?;
        let user_id = self.store.user_id_for_token(token).await?;
        Ok(user_id.to_string())
    }

    /// Publish the reply, if the request asked for one.
    ///
    /// The correlation id is always the one carried by the request; a
    /// request lacking either property gets no reply.
    fn send_reply(&self, request: &Message, user_id: String) {
        let (Some(reply_to), Some(correlation_id)) =
            (request.reply_to.as_deref(), request.correlation_id.as_deref())
        else {
            debug!("Request without reply-to or correlation id, nothing to send");
            return;
        };

        let reply = Message::reply(Bytes::from(user_id), correlation_id);
        match self.connection.publish(reply_to, reply) {
            Ok(()) => debug!(
                correlation_id = %correlation_id,
                reply_to = %reply_to,
                "Published reply"
            ),
            Err(e) => warn!(
                correlation_id = %correlation_id,
                reply_to = %reply_to,
                error = %e,
                "Failed to publish reply"
            ),
        }
    }

    /// Signal the consume loop to stop after the message in flight.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Close the worker's connection.
    ///
    /// Call after [`RpcWorker::run`] has returned so in-flight processing
    /// drains first.
    pub fn close(&self) {
        self.connection.close();
        info!("[rpc-worker] closed");
    }
}
