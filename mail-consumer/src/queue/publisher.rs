//! Async RabbitMQ publisher for enqueueing jobs.
//!
//! Used by the `mail-enqueue` tool to place reminder and security-code
//! jobs on the queues the consumer serves. The publisher keeps one
//! connection and channel and reopens them if they drop.

use std::sync::Arc;

use anyhow::{Context, Result};
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::types::JobEnvelope;
use crate::util::redact_url;

/// Async RabbitMQ publisher with connection management.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    url: String,
    queues: Vec<String>,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl Publisher {
    /// Create a publisher that declares `queues` durable on first connect.
    pub fn new(url: String, queues: Vec<String>) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                url,
                queues,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<Channel> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!(endpoint = %redact_url(&self.inner.url), "rabbitmq_publisher_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        let ch = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        for queue in &self.inner.queues {
            ch.queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare queue {queue}"))?;
        }

        info!(queues = ?self.inner.queues, "rabbitmq_publisher_connected");

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Publish a job envelope to `queue` as a persistent JSON message.
    pub async fn publish(&self, queue: &str, envelope: &JobEnvelope, message_id: &str) -> Result<()> {
        let channel = self.ensure_connected().await?;

        let body = serde_json::to_vec(envelope).context("Failed to serialize job")?;

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(message_id.to_string().into()),
            )
            .await
            .with_context(|| format!("Failed to publish to {queue}"))?
            .await
            .context("Failed to confirm publish")?;

        info!(
            queue = %queue,
            pattern = %envelope.pattern,
            message_id = %message_id,
            body_length = body.len(),
            "rabbitmq_job_published"
        );

        Ok(())
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_publisher_closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobKind, SecurityCodeJob, VERIFICATION_SUBJECT};

    #[tokio::test]
    async fn test_publish_fails_without_broker() {
        let publisher = Publisher::new(
            "amqp://127.0.0.1:1/%2f".to_string(),
            vec!["email_queue".to_string()],
        );
        let job = SecurityCodeJob {
            recipient: "user@test.com".to_string(),
            code: "123456".to_string(),
            subject: VERIFICATION_SUBJECT.to_string(),
            kind: None,
        };
        let envelope = JobEnvelope::new(JobKind::SecurityCode, &job).unwrap();

        let err = publisher
            .publish("email_queue", &envelope, "user@test.com")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to connect"));

        // Closing an unopened publisher is a no-op.
        publisher.close().await;
    }
}
