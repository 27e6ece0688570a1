//! # RPC Client and Reply Listener
//!
//! The calling side of the RPC layer.
//!
//! ## Call Flow
//!
//! ```text
//! caller                      RpcClient                 broker
//!   │  call(payload, timeout)     │                        │
//!   │ ───────────────────────────▶│ register(id)           │
//!   │                             │ publish(request_queue, │
//!   │                             │   body, correlation-id,│
//!   │                             │   reply-to) ──────────▶│
//!   │        suspend on slot      │                        │
//!   │ ◀┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄ │                        │
//!   │                             │      ReplyListener     │
//!   │                             │ ◀──────────────────────│ reply
//!   │   payload / Timeout         │ resolve(id, body)      │
//!   │ ◀───────────────────────────│                        │
//! ```
//!
//! One connection and one exclusive reply queue serve every concurrent call;
//! calls suspend individually on their result slots. No exit path, success,
//! timeout, or cancellation, leaves an id registered.

use crate::config::RpcConfig;
use crate::correlation::CorrelationId;
use crate::error::RpcError;
use crate::pending::PendingCallRegistry;
use bytes::Bytes;
use parking_lot::RwLock;
use shared_queue::{Connection, Consumer, Message, QueueBroker, QueueError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Cadence of the backstop sweep for abandoned pending calls.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// The connection-scoped pieces replaced wholesale on reconnect.
struct RpcChannel {
    connection: Connection,
    reply_queue: String,
}

/// Asynchronous RPC client over the message broker.
///
/// Publishes requests to the well-known request queue and awaits correlated
/// replies on a client-private exclusive queue. Shared freely across tasks;
/// each `call` suspends without blocking the others.
pub struct RpcClient {
    registry: Arc<PendingCallRegistry>,
    channel: RwLock<RpcChannel>,
    config: RpcConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl RpcClient {
    /// Connect to the broker.
    ///
    /// Declares the exclusive reply queue and spawns the reply listener and
    /// the registry sweeper. Must be called from within a tokio runtime.
    pub fn connect(broker: &QueueBroker, config: RpcConfig) -> Result<Self, RpcError> {
        config.validate()?;

        let registry = Arc::new(PendingCallRegistry::new());
        let (shutdown_tx, _) = watch::channel(false);

        let channel = Self::open_channel(broker, &registry, &shutdown_tx)?;
        info!(reply_queue = %channel.reply_queue, "[rpc-client] connected");

        let client = Self {
            registry,
            channel: RwLock::new(channel),
            config,
            shutdown_tx,
        };
        client.spawn_sweeper();

        Ok(client)
    }

    /// Open a fresh connection, reply queue, and listener.
    fn open_channel(
        broker: &QueueBroker,
        registry: &Arc<PendingCallRegistry>,
        shutdown_tx: &watch::Sender<bool>,
    ) -> Result<RpcChannel, RpcError> {
        let connection = broker.connect();
        let reply_queue = connection.declare_exclusive_queue()?;

        // Replies are acked on arrival; the reply queue needs no prefetch
        // bound.
        let consumer = connection.consume(&reply_queue, 0)?;
        let listener = ReplyListener {
            consumer,
            registry: Arc::clone(registry),
            shutdown: shutdown_tx.subscribe(),
        };
        tokio::spawn(listener.run());

        Ok(RpcChannel {
            connection,
            reply_queue,
        })
    }

    fn spawn_sweeper(&self) {
        let registry = Arc::clone(&self.registry);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let swept = registry.sweep_expired();
                        if swept > 0 {
                            debug!(swept, "Swept abandoned pending calls");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Issue a call and await the correlated reply.
    ///
    /// # Errors
    ///
    /// - [`RpcError::NotConnected`] immediately if the connection is closed
    /// - [`RpcError::Timeout`] if no reply arrives within `timeout`
    /// - [`RpcError::Cancelled`] if the client shuts down mid-call
    pub async fn call(&self, payload: Bytes, timeout: Duration) -> Result<Bytes, RpcError> {
        let (connection, reply_queue) = {
            let channel = self.channel.read();
            (channel.connection.clone(), channel.reply_queue.clone())
        };

        if !connection.is_connected() {
            return Err(RpcError::NotConnected);
        }

        let id = CorrelationId::new();
        let mut rx = self.registry.register(id, timeout)?;

        let request = Message::request(payload, id.to_string(), reply_queue);
        if let Err(e) = connection.publish(&self.config.request_queue, request) {
            self.registry.cancel(id);
            return Err(match e {
                QueueError::NotConnected => RpcError::NotConnected,
                other => RpcError::Transport(other),
            });
        }

        debug!(
            correlation_id = %id,
            queue = %self.config.request_queue,
            timeout_ms = timeout.as_millis() as u64,
            "Published RPC request"
        );

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Slot sender dropped without a value; shouldn't happen
                // outside shutdown races.
                self.registry.cancel(id);
                Err(RpcError::Cancelled)
            }
            Err(_) => {
                if self.registry.expire(id) {
                    Err(RpcError::Timeout(timeout))
                } else {
                    // A resolution won the race against the deadline. Every
                    // removal path writes the slot right after removing the
                    // entry, so this await completes immediately.
                    match rx.await {
                        Ok(result) => result,
                        Err(_) => Err(RpcError::Timeout(timeout)),
                    }
                }
            }
        }
    }

    /// Issue a call with the configured default timeout.
    pub async fn call_default(&self, payload: Bytes) -> Result<Bytes, RpcError> {
        self.call(payload, self.config.default_timeout).await
    }

    /// Reconnect after a connection loss.
    ///
    /// Fails every in-flight call with [`RpcError::ConnectionLost`] (their
    /// replies would be addressed to the dead reply queue), then retries
    /// with exponential backoff until a fresh connection, reply queue, and
    /// listener are up.
    pub async fn reconnect(&self, broker: &QueueBroker) -> Result<(), RpcError> {
        self.channel.read().connection.close();
        self.registry.fail_all(&RpcError::ConnectionLost);

        let settings = &self.config.reconnect;
        let mut backoff = settings.initial_backoff;
        let mut last_error = RpcError::NotConnected;

        for attempt in 1..=settings.max_attempts {
            match Self::open_channel(broker, &self.registry, &self.shutdown_tx) {
                Ok(channel) => {
                    info!(attempt, reply_queue = %channel.reply_queue, "[rpc-client] reconnected");
                    *self.channel.write() = channel;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "[rpc-client] reconnect attempt failed"
                    );
                    last_error = e;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(settings.max_backoff);
                }
            }
        }

        Err(last_error)
    }

    /// Shut the client down.
    ///
    /// Stops the listener and sweeper, fails pending calls with
    /// [`RpcError::Cancelled`], and closes the connection. Idempotent.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        self.registry.fail_all(&RpcError::Cancelled);
        self.channel.read().connection.close();
        info!("[rpc-client] closed");
    }

    /// Whether the underlying connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.channel.read().connection.is_connected()
    }

    /// Number of calls currently awaiting replies.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    /// Lifetime call counters.
    #[must_use]
    pub fn stats(&self) -> &crate::pending::CallStats {
        self.registry.stats()
    }
}

/// Consumes the exclusive reply queue and resolves pending calls.
///
/// Runs for the lifetime of the connection. Each reply is acked on arrival
/// and matched against the registry; replies bearing unknown or expired
/// correlation ids are dropped without affecting other calls.
struct ReplyListener {
    consumer: Consumer,
    registry: Arc<PendingCallRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl ReplyListener {
    async fn run(mut self) {
        debug!(queue = %self.consumer.queue_name(), "[reply-listener] consuming reply queue");

        loop {
            tokio::select! {
                delivery = self.consumer.recv() => {
                    let Some(mut delivery) = delivery else {
                        warn!("[reply-listener] reply queue closed, stopping");
                        break;
                    };
                    delivery.ack();
                    self.handle(delivery.into_message());
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!("[reply-listener] shutdown signal received");
                        break;
                    }
                }
            }
        }
    }

    fn handle(&self, message: Message) {
        let Some(raw) = message.correlation_id else {
            warn!("Reply without correlation id, dropping");
            return;
        };

        let Ok(id) = CorrelationId::parse(&raw) else {
            warn!(correlation_id = %raw, "Unparseable correlation id, dropping");
            return;
        };

        if !self.registry.resolve(id, message.body) {
            debug!(correlation_id = %id, "Reply for unknown or expired correlation id, dropping");
        }
    }
}
