//! Broker connection lifecycle.
//!
//! One connection per process, one channel per subscribed queue. Each
//! channel is owned by exactly one queue worker, so acks and nacks on a
//! channel are never issued concurrently.

use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties, Consumer,
};
use tracing::{info, warn};

use crate::consumer::PREFETCH_COUNT;
use crate::error::ConnectionError;
use crate::queue::QueueBinding;
use crate::util::redact_url;

/// An open subscription on one queue.
pub struct Subscription {
    pub binding: QueueBinding,
    pub channel: Channel,
    pub consumer: Consumer,
    pub consumer_tag: String,
}

/// Connection to RabbitMQ plus the channels opened on it.
pub struct Broker {
    endpoint: String,
    connection: Option<Connection>,
    channels: Vec<Channel>,
}

impl Broker {
    /// Open a connection to `url`.
    pub async fn connect(url: &str) -> Result<Self, ConnectionError> {
        let endpoint = redact_url(url);
        info!(endpoint = %endpoint, "rabbitmq_connecting");

        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|source| ConnectionError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;

        info!(endpoint = %endpoint, "rabbitmq_connected");

        Ok(Self {
            endpoint,
            connection: Some(connection),
            channels: Vec::new(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.status().connected())
            .unwrap_or(false)
    }

    /// Open a channel for `binding`, declare its queues and start consuming.
    ///
    /// The queue and its dead-letter companion are declared durable so they
    /// survive a broker restart. Prefetch is applied per consumer and the
    /// channel is put in publisher-confirm mode.
    pub async fn subscribe(&mut self, binding: &QueueBinding) -> Result<Subscription, ConnectionError> {
        let connection = self.connection.as_ref().ok_or(ConnectionError::Closed)?;
        let queue = binding.queue.as_str();

        let channel = connection
            .create_channel()
            .await
            .map_err(ConnectionError::Channel)?;
        self.channels.push(channel.clone());

        info!(queue = %queue, channel_id = channel.id(), "rabbitmq_channel_created");

        // Dead-letter copies are only acked away once the broker confirms them.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|source| ConnectionError::Confirm {
                queue: queue.to_string(),
                source,
            })?;

        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(|source| ConnectionError::Qos {
                queue: queue.to_string(),
                source,
            })?;

        info!(queue = %queue, prefetch_count = PREFETCH_COUNT, "rabbitmq_qos_set");

        for name in [binding.queue.clone(), binding.dead_letter_queue()] {
            channel
                .queue_declare(
                    &name,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|source| ConnectionError::Declare {
                    queue: name.clone(),
                    source,
                })?;

            info!(queue = %name, "rabbitmq_queue_declared");
        }

        let consumer_tag = format!("mail-consumer-{queue}");
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| ConnectionError::Consume {
                queue: queue.to_string(),
                source,
            })?;

        info!(
            queue = %queue,
            consumer_tag = %consumer_tag,
            kind = binding.kind.as_str(),
            "rabbitmq_consumer_started"
        );

        Ok(Subscription {
            binding: binding.clone(),
            channel,
            consumer,
            consumer_tag,
        })
    }

    /// Close every channel, then the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        for channel in self.channels.drain(..) {
            if !channel.status().connected() {
                continue;
            }
            if let Err(e) = channel.close(200, "Normal shutdown").await {
                warn!(channel_id = channel.id(), error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(connection) = self.connection.take() {
            if connection.status().connected() {
                if let Err(e) = connection.close(200, "Normal shutdown").await {
                    warn!(error = %e, "rabbitmq_connection_close_error");
                }
            }
            info!(endpoint = %self.endpoint, "rabbitmq_connection_closed");
        }
    }
}
