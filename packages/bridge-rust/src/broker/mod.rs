//! Pluggable message broker backends.
//!
//! The publisher and server talk to the broker only through the [`Broker`]
//! trait. Implementations: AMQP via `lapin` ([`amqp`]), in-process memory
//! ([`memory`], tests and local runs). A [`Connector`] produces fresh broker
//! channels for the connection manager.

pub mod amqp;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::MessageProperties;
use futures_util::stream::BoxStream;

use crate::error::BrokerError;

pub use amqp::{AmqpBroker, AmqpConnector};
pub use memory::{MemoryBroker, MemoryChannel, MemoryConnector};

// ---------------------------------------------------------------------------
// Options and deliveries
// ---------------------------------------------------------------------------

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Owned by the declaring connection; deleted when it closes.
    pub exclusive: bool,
    /// Deleted once the last consumer unsubscribes.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// A well-known request queue.
    #[must_use]
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    /// A private reply queue.
    #[must_use]
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            auto_delete: true,
            ..Self::default()
        }
    }
}

/// Consumer subscription flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries are considered acknowledged as soon as they are sent.
    pub no_ack: bool,
    /// Maximum unacknowledged deliveries in flight. Ignored when `no_ack`.
    pub prefetch: Option<u16>,
}

impl ConsumeOptions {
    /// Broker-side acknowledgement, no flow control.
    #[must_use]
    pub fn auto_ack() -> Self {
        Self {
            no_ack: true,
            prefetch: None,
        }
    }

    /// Explicit acknowledgement with at most `prefetch` deliveries in flight.
    #[must_use]
    pub fn manual(prefetch: u16) -> Self {
        Self {
            no_ack: false,
            prefetch: Some(prefetch),
        }
    }
}

/// Result of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    /// Actual queue name. Broker-generated when an empty name was declared.
    pub name: String,
    /// Messages ready for delivery at declaration time.
    pub message_count: u32,
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Stream of deliveries for one consumer. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

// ---------------------------------------------------------------------------
// Broker / Connector traits
// ---------------------------------------------------------------------------

/// One open channel to a message broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Declares a queue, creating it if needed. An empty `name` asks the
    /// broker to generate one.
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<DeclaredQueue, BrokerError>;

    /// Publishes `body` to `queue` through the default exchange and waits for
    /// the broker to accept it.
    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Starts a consumer on `queue`.
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Acknowledges a delivery received on this channel.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Number of messages ready for delivery in `queue`.
    async fn message_count(&self, queue: &str) -> Result<u32, BrokerError>;

    /// Returns `false` once the channel or its connection has closed.
    fn is_open(&self) -> bool;
}

/// Opens new broker channels on demand.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establishes a connection and returns a ready channel.
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError>;

    /// Human-readable endpoint for log output. Must not contain credentials.
    fn endpoint(&self) -> String;
}
