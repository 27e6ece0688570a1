//! # Queues and Consumers
//!
//! Queue storage and the consuming side of the transport.

use crate::connection::ConnectionState;
use crate::message::{Delivery, Message};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use uuid::Uuid;

/// A declared queue.
///
/// The broker's queue map holds the only long-lived sender; removing the
/// queue from the map drops it, which ends every consumer's stream.
#[derive(Debug)]
pub(crate) struct Queue {
    pub(crate) tx: mpsc::Sender<Message>,
    pub(crate) rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    /// Connection that declared this queue exclusively, if any.
    pub(crate) exclusive_owner: Option<Uuid>,
}

impl Queue {
    pub(crate) fn new(capacity: usize, exclusive_owner: Option<Uuid>) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            exclusive_owner,
        }
    }
}

/// A consumer attached to one queue.
///
/// Multiple consumers may drain the same queue (competing consumers); each
/// one bounds its own in-flight window with a prefetch semaphore. The
/// consumer observes its connection's state and fails fast when the
/// connection closes.
pub struct Consumer {
    queue_name: String,
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    permits: Arc<Semaphore>,
    state: watch::Receiver<ConnectionState>,
}

impl Consumer {
    pub(crate) fn new(
        queue_name: String,
        rx: Arc<Mutex<mpsc::Receiver<Message>>>,
        prefetch: usize,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        // Prefetch 0 means unbounded, as in AMQP basic.qos.
        let permits = if prefetch == 0 {
            Semaphore::MAX_PERMITS
        } else {
            prefetch
        };
        Self {
            queue_name,
            rx,
            permits: Arc::new(Semaphore::new(permits)),
            state,
        }
    }

    /// Name of the queue this consumer drains.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Receive the next delivery.
    ///
    /// Waits for a prefetch permit first, so at most `prefetch` deliveries
    /// are unacknowledged at any time.
    ///
    /// # Returns
    ///
    /// - `Some(delivery)` - the next message from the queue
    /// - `None` - the queue was deleted or the connection closed
    pub async fn recv(&mut self) -> Option<Delivery> {
        if *self.state.borrow() == ConnectionState::Closed {
            return None;
        }

        let permit = self.permits.clone().acquire_owned().await.ok()?;
        let rx = Arc::clone(&self.rx);

        tokio::select! {
            message = async move { rx.lock().await.recv().await } => {
                message.map(|m| Delivery::new(m, permit))
            }
            () = wait_closed(&mut self.state) => None,
        }
    }
}

/// Resolve when the connection reports `Closed` or its state channel is gone.
async fn wait_closed(state: &mut watch::Receiver<ConnectionState>) {
    loop {
        if *state.borrow() == ConnectionState::Closed {
            return;
        }
        if state.changed().await.is_err() {
            // State sender dropped, treat as closed.
            return;
        }
    }
}
