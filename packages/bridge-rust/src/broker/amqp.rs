//! AMQP 0-9-1 backend built on `lapin`.
//!
//! Each [`AmqpBroker`] owns one connection and one channel in publisher
//! confirm mode, so `publish` resolves only once the broker has taken
//! responsibility for the message.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{CorrelationId, MessageProperties};
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::debug;

use super::{Broker, ConsumeOptions, DeclaredQueue, Delivery, DeliveryStream, QueueOptions};
use super::Connector;
use crate::error::BrokerError;

/// AMQP `delivery_mode` value asking the broker to persist the message.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

// ---------------------------------------------------------------------------
// AmqpConnector
// ---------------------------------------------------------------------------

/// Connects to an AMQP broker at a fixed URL.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        debug!(endpoint = %self.endpoint(), channel_id = channel.id(), "AMQP channel opened");
        Ok(Arc::new(AmqpBroker {
            connection,
            channel,
        }))
    }

    fn endpoint(&self) -> String {
        redact_credentials(&self.url)
    }
}

/// Strips the `user:password@` part of a URL.
fn redact_credentials(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => match rest.rsplit_once('@') {
            Some((_, host)) => format!("{scheme}://***@{host}"),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}

// ---------------------------------------------------------------------------
// AmqpBroker
// ---------------------------------------------------------------------------

/// One AMQP connection with a single confirm-mode channel.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    fn properties(properties: &MessageProperties) -> BasicProperties {
        let mut props = BasicProperties::default();
        if let Some(id) = &properties.correlation_id {
            props = props.with_correlation_id(id.as_str().into());
        }
        if let Some(reply_to) = &properties.reply_to {
            props = props.with_reply_to(reply_to.as_str().into());
        }
        if properties.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }
        props
    }

    fn delivery(delivery: lapin::message::Delivery) -> Delivery {
        let properties = MessageProperties {
            correlation_id: delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|id| CorrelationId::from(id.as_str())),
            reply_to: delivery
                .properties
                .reply_to()
                .as_ref()
                .map(|q| q.as_str().to_string()),
            persistent: *delivery.properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        };
        Delivery {
            delivery_tag: delivery.delivery_tag,
            body: delivery.data,
            properties,
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<DeclaredQueue, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(DeclaredQueue {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
        })
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                Self::properties(properties),
            )
            .await?
            .await?;
        if confirm.is_nack() {
            return Err(BrokerError::Nacked {
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        if let (false, Some(prefetch)) = (options.no_ack, options.prefetch) {
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await?;
        }
        let consumer_tag = format!("courier-{}", uuid::Uuid::new_v4().simple());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|item| item.map(Self::delivery).map_err(BrokerError::from))
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn message_count(&self, queue: &str) -> Result<u32, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.message_count())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}
