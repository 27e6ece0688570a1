//! # Messages and Deliveries
//!
//! A [`Message`] is what gets published: a byte body plus the two broker
//! properties the RPC layer cares about, `correlation-id` and `reply-to`.
//! A [`Delivery`] is a consumed message together with its acknowledgment
//! handle.

use bytes::Bytes;
use tokio::sync::OwnedSemaphorePermit;

/// A message published to a queue.
///
/// Properties are opaque strings at this layer; higher layers assign them
/// meaning (the RPC layer parses `correlation_id` into a typed id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Raw payload bytes.
    pub body: Bytes,

    /// Opaque token linking a request to its eventual reply.
    pub correlation_id: Option<String>,

    /// Queue the responder should publish the reply to.
    pub reply_to: Option<String>,
}

impl Message {
    /// Create a plain message with no properties.
    #[must_use]
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            correlation_id: None,
            reply_to: None,
        }
    }

    /// Create a request message carrying both a correlation id and a
    /// reply-to address.
    #[must_use]
    pub fn request(
        body: impl Into<Bytes>,
        correlation_id: impl Into<String>,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            body: body.into(),
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
        }
    }

    /// Create a reply message.
    ///
    /// Carries the correlation id copied from the request and no `reply_to`.
    #[must_use]
    pub fn reply(body: impl Into<Bytes>, correlation_id: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            correlation_id: Some(correlation_id.into()),
            reply_to: None,
        }
    }
}

/// A consumed message plus its acknowledgment handle.
///
/// An unacknowledged delivery holds one prefetch permit on its consumer;
/// [`Delivery::ack`] releases it. Dropping an unacked delivery also releases
/// the permit (redelivery policy is a broker configuration concern, not
/// handled here).
#[derive(Debug)]
pub struct Delivery {
    message: Message,
    permit: Option<OwnedSemaphorePermit>,
}

impl Delivery {
    pub(crate) fn new(message: Message, permit: OwnedSemaphorePermit) -> Self {
        Self {
            message,
            permit: Some(permit),
        }
    }

    /// The delivered message.
    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The message body.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.message.body
    }

    /// The `correlation-id` property, if set.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.message.correlation_id.as_deref()
    }

    /// The `reply-to` property, if set.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.message.reply_to.as_deref()
    }

    /// Acknowledge the delivery, releasing its prefetch permit.
    ///
    /// Idempotent: returns `true` the first time, `false` on every
    /// subsequent call.
    pub fn ack(&mut self) -> bool {
        self.permit.take().is_some()
    }

    /// Whether this delivery has already been acknowledged.
    #[must_use]
    pub fn is_acked(&self) -> bool {
        self.permit.is_none()
    }

    /// Consume the delivery, returning the message.
    ///
    /// Releases the prefetch permit if the delivery was not acked.
    #[must_use]
    pub fn into_message(self) -> Message {
        self.message
    }
}
