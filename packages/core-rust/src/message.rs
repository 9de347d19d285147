//! Transport-level message properties.
//!
//! The correlation id and reply address travel alongside the body, never
//! inside it. Brokers map these onto their native property fields (AMQP
//! `correlation_id`, `reply_to`, `delivery_mode`).

use crate::correlation::CorrelationId;

/// Properties attached to every published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Links a reply to the request that caused it.
    pub correlation_id: Option<CorrelationId>,
    /// Queue the receiver should publish its reply to.
    pub reply_to: Option<String>,
    /// Durability hint: ask the broker to persist the message to disk.
    pub persistent: bool,
}

impl MessageProperties {
    /// Properties for an outbound request expecting a reply on `reply_to`.
    #[must_use]
    pub fn request(correlation_id: CorrelationId, reply_to: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to.into()),
            persistent: true,
        }
    }

    /// Properties for a reply to the request identified by `correlation_id`.
    #[must_use]
    pub fn reply(correlation_id: Option<CorrelationId>) -> Self {
        Self {
            correlation_id,
            reply_to: None,
            persistent: false,
        }
    }

    /// Returns `true` when the sender expects a reply.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.reply_to.as_deref().is_some_and(|q| !q.is_empty())
    }
}
