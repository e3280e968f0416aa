//! AMQP broker (feature `amqp`).
//!
//! Publishes through the default exchange straight to the named queue.
//! Every consumer gets its own channel so its prefetch window is
//! independent of the others.

use std::fmt;

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use crate::rpc::broker::{BrokerError, ConsumeOptions, Consumer, Delivery, MessageBroker, OutboundMessage};

pub struct AmqpBroker {
    url: String,
    connection: Connection,
    channel: Channel,
}

impl fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpBroker").field("url", &self.url).finish()
    }
}

fn connection_error(err: lapin::Error) -> BrokerError {
    BrokerError::Connection(err.to_string())
}

impl AmqpBroker {
    /// Connect to `url` and open the channel used for declares and publishes.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(connection_error)?;
        let channel = connection.create_channel().await.map_err(connection_error)?;
        tracing::info!(url = %redact(url), "Connected to AMQP broker");
        Ok(Self {
            url: redact(url),
            connection,
            channel,
        })
    }
}

/// Strip credentials before a URL is logged.
fn redact(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            let _ = parsed.set_password(None);
            let _ = parsed.set_username("");
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(name, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(connection_error)?;
        Ok(())
    }

    async fn declare_reply_queue(&self) -> Result<String, BrokerError> {
        let options = QueueDeclareOptions {
            exclusive: true,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .channel
            .queue_declare("", options, FieldTable::default())
            .await
            .map_err(connection_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(connection_error)?;
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default();
        if let Some(id) = message.correlation_id {
            properties = properties.with_correlation_id(id.into());
        }
        if let Some(reply_to) = message.reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }

        self.channel
            .basic_publish("", queue, BasicPublishOptions::default(), &message.body, properties)
            .await
            .map_err(|e| BrokerError::Publish {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Box<dyn Consumer>, BrokerError> {
        let channel = self.connection.create_channel().await.map_err(connection_error)?;
        if options.prefetch > 0 {
            channel
                .basic_qos(options.prefetch, BasicQosOptions::default())
                .await
                .map_err(connection_error)?;
        }

        let consume_options = BasicConsumeOptions {
            no_ack: options.auto_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = channel
            .basic_consume(queue, "", consume_options, FieldTable::default())
            .await
            .map_err(connection_error)?;

        Ok(Box::new(AmqpConsumer { channel, consumer }))
    }
}

struct AmqpConsumer {
    channel: Channel,
    consumer: lapin::Consumer,
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        match self.consumer.next().await? {
            Ok(delivery) => Some(Delivery {
                tag: delivery.delivery_tag,
                correlation_id: delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string()),
                reply_to: delivery
                    .properties
                    .reply_to()
                    .as_ref()
                    .map(|queue| queue.as_str().to_string()),
                body: Bytes::from(delivery.data),
            }),
            Err(e) => {
                tracing::warn!(error = %e, "AMQP consumer failed");
                None
            }
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(connection_error)
    }
}
