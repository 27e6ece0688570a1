//! # Broker and Connections
//!
//! [`QueueBroker`] owns the queue map; [`Connection`] is the handle a service
//! holds onto it. One connection is shared by all of a service's concurrent
//! logical calls; publish and consume are safe under concurrent use (queue
//! map mutation only, no lock held across a suspension point).
//!
//! Connection lifecycle: connect, then explicit [`Connection::close`] on
//! shutdown. Closing deletes the connection's exclusive queues and flips a
//! state channel that consumers and listeners watch so they fail fast rather
//! than hang.

use crate::error::QueueError;
use crate::message::Message;
use crate::queue::{Consumer, Queue};
use crate::{DEFAULT_QUEUE_CAPACITY, EXCLUSIVE_QUEUE_PREFIX};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connection lifecycle state, broadcast to dependents on change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The connection is usable.
    Connected,
    /// The connection was closed; publishes fail and consumers end.
    Closed,
}

/// In-memory message broker.
///
/// Routes published messages to named queues. Suitable for single-process
/// operation and tests; a distributed deployment would put a networked
/// broker behind the same [`Connection`] surface.
pub struct QueueBroker {
    queues: Arc<DashMap<String, Queue>>,
    capacity: usize,
}

impl QueueBroker {
    /// Create a broker with the default per-queue capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a broker with a specific per-queue capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            capacity,
        }
    }

    /// Open a new connection to this broker.
    #[must_use]
    pub fn connect(&self) -> Connection {
        let id = Uuid::new_v4();
        let (state_tx, _) = watch::channel(ConnectionState::Connected);

        debug!(connection_id = %id, "Connection opened");

        Connection {
            inner: Arc::new(ConnectionInner {
                id,
                queues: Arc::clone(&self.queues),
                capacity: self.capacity,
                state_tx,
            }),
        }
    }

    /// Number of queues currently declared.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Whether a queue with this name exists.
    #[must_use]
    pub fn queue_exists(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }
}

impl Default for QueueBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// A connection handle to the broker.
///
/// Cheap to clone; all clones share one logical connection and one state
/// channel.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: Uuid,
    queues: Arc<DashMap<String, Queue>>,
    capacity: usize,
    state_tx: watch::Sender<ConnectionState>,
}

impl Connection {
    /// Declare a named, shared queue.
    ///
    /// Idempotent: redeclaring an existing shared queue is a no-op.
    /// Redeclaring a queue that is exclusive to another connection fails.
    pub fn declare_queue(&self, name: &str) -> Result<(), QueueError> {
        self.ensure_connected()?;

        match self.inner.queues.entry(name.to_string()) {
            Entry::Occupied(entry) => match entry.get().exclusive_owner {
                Some(owner) if owner != self.inner.id => {
                    Err(QueueError::ExclusiveViolation(name.to_string()))
                }
                _ => Ok(()),
            },
            Entry::Vacant(entry) => {
                entry.insert(Queue::new(self.inner.capacity, None));
                debug!(queue = name, "Queue declared");
                Ok(())
            }
        }
    }

    /// Declare an auto-named queue exclusive to this connection.
    ///
    /// Only this connection may consume from it; any connection may publish
    /// to it (that is how replies arrive). The queue is deleted when this
    /// connection closes.
    ///
    /// # Returns
    ///
    /// The generated queue name.
    pub fn declare_exclusive_queue(&self) -> Result<String, QueueError> {
        self.ensure_connected()?;

        let name = format!("{}{}", EXCLUSIVE_QUEUE_PREFIX, Uuid::new_v4());
        self.inner
            .queues
            .insert(name.clone(), Queue::new(self.inner.capacity, Some(self.inner.id)));

        debug!(queue = %name, connection_id = %self.inner.id, "Exclusive queue declared");
        Ok(name)
    }

    /// Publish a message to the queue bound to `routing_key`.
    ///
    /// A message routed to a nonexistent queue is dropped, as with an
    /// unroutable default-exchange publish without the mandatory flag.
    pub fn publish(&self, routing_key: &str, message: Message) -> Result<(), QueueError> {
        self.ensure_connected()?;

        let Some(queue) = self.inner.queues.get(routing_key) else {
            warn!(queue = routing_key, "Message unroutable, dropping");
            return Ok(());
        };

        match queue.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(QueueError::QueueFull(routing_key.to_string())),
            Err(TrySendError::Closed(_)) => {
                // Queue deleted between lookup and send.
                warn!(queue = routing_key, "Queue deleted, message dropped");
                Ok(())
            }
        }
    }

    /// Start consuming from a queue with a prefetch window.
    ///
    /// `prefetch` bounds the unacknowledged deliveries this consumer may
    /// hold; `0` means unbounded.
    pub fn consume(&self, queue: &str, prefetch: usize) -> Result<Consumer, QueueError> {
        self.ensure_connected()?;

        let Some(entry) = self.inner.queues.get(queue) else {
            return Err(QueueError::QueueNotFound(queue.to_string()));
        };

        if let Some(owner) = entry.exclusive_owner {
            if owner != self.inner.id {
                return Err(QueueError::ExclusiveViolation(queue.to_string()));
            }
        }

        debug!(queue = queue, prefetch = prefetch, "Consumer attached");

        Ok(Consumer::new(
            queue.to_string(),
            Arc::clone(&entry.rx),
            prefetch,
            self.inner.state_tx.subscribe(),
        ))
    }

    /// Close the connection.
    ///
    /// Deletes this connection's exclusive queues, which ends their
    /// consumers, and flips the state channel so every dependent observes
    /// the closure. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether the connection is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.state_tx.borrow() == ConnectionState::Connected
    }

    /// Subscribe to connection state changes.
    ///
    /// Dependents use this to fail fast on disconnection instead of hanging.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    fn ensure_connected(&self) -> Result<(), QueueError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(QueueError::NotConnected)
        }
    }
}

impl ConnectionInner {
    fn close(&self) {
        let previous = self.state_tx.send_replace(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return;
        }

        let id = self.id;
        self.queues
            .retain(|_, queue| queue.exclusive_owner != Some(id));

        info!(connection_id = %id, "Connection closed");
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.close();
    }
}
