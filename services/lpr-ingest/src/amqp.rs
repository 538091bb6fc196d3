//! AMQP 0-9-1 implementation of the broker seam.

use crate::broker::{
    Acknowledger, BrokerChannel, BrokerError, CloseNotifier, Connector, Delivery, DeliveryStream,
    QueueSpec,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tracing::{debug, info, warn};

const PERSISTENT: u8 = 2;

/// Opens AMQP connections to a single broker URI
pub struct AmqpConnector {
    uri: String,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        prefetch: u16,
        on_close: CloseNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        connection.on_error(move |err| {
            on_close.notify(BrokerError::Closed(err.to_string()));
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        info!(prefetch = prefetch, "AMQP channel opened");

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
        }))
    }
}

/// Open AMQP channel; keeps its connection alive
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

/// Queue arguments: quorum type plus optional message TTL
fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-queue-type".into(),
        AMQPValue::LongString("quorum".into()),
    );
    if let Some(ttl) = spec.message_ttl {
        arguments.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(ttl.as_millis() as i64),
        );
    }
    arguments
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                kind: "exchange",
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments(spec),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                kind: "queue",
                name: spec.name.clone(),
                message: e.to_string(),
            })?;

        self.channel
            .queue_bind(
                &spec.name,
                &spec.exchange,
                &spec.binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                kind: "binding",
                name: format!("{} -> {}", spec.binding_key, spec.name),
                message: e.to_string(),
            })?;

        debug!(
            queue = %spec.name,
            exchange = %spec.exchange,
            binding_key = %spec.binding_key,
            "Queue declared and bound"
        );
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        let queue = queue.to_string();
        let stream = consumer.map(move |delivery| {
            delivery
                .map(|delivery| Delivery {
                    routing_key: delivery.routing_key.as_str().to_string(),
                    payload: delivery.data,
                    redelivered: delivery.redelivered,
                    acker: Box::new(AmqpAcker(delivery.acker)),
                })
                .map_err(|e| BrokerError::Consume {
                    queue: queue.clone(),
                    message: e.to_string(),
                })
        });

        Ok(stream.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let publish_error = |e: lapin::Error| BrokerError::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: e.to_string(),
        };

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) {
        if !self.connection.status().connected() {
            return;
        }
        match self.connection.close(200, "reconnecting").await {
            Ok(()) => debug!("AMQP connection closed"),
            Err(e) => warn!(error = %e, "Failed to close AMQP connection"),
        }
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
