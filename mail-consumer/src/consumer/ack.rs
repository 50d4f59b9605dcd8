//! Acknowledgment contract.
//!
//! Every delivery ends in exactly one [`Disposition`]: acknowledged,
//! negative-acknowledged with requeue, or moved to the queue's dead-letter
//! companion once its retry budget is spent.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel,
};

use crate::error::DeadLetterError;

/// Broker operations a queue worker needs to settle a delivery.
#[async_trait]
pub trait AckChannel: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), lapin::Error>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), lapin::Error>;

    /// Publish a copy of a failed message to `queue`.
    ///
    /// Returns `Ok` only once the broker has confirmed the copy as routed.
    async fn dead_letter(
        &self,
        queue: &str,
        letter: &DeadLetter<'_>,
    ) -> Result<(), DeadLetterError>;
}

/// A message that exhausted its retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter<'a> {
    pub original_queue: &'a str,
    pub reason: &'a str,
    pub attempts: u32,
    pub message_id: Option<&'a str>,
    pub body: &'a [u8],
}

impl DeadLetter<'_> {
    /// AMQP headers describing why the message was dead-lettered.
    pub fn headers(&self) -> FieldTable {
        let mut headers = FieldTable::default();
        headers.insert(
            "x-original-queue".into(),
            AMQPValue::LongString(self.original_queue.to_string().into()),
        );
        headers.insert(
            "x-failure-reason".into(),
            AMQPValue::LongString(self.reason.to_string().into()),
        );
        headers.insert(
            "x-delivery-attempts".into(),
            AMQPValue::LongLongInt(i64::from(self.attempts)),
        );
        headers
    }
}

#[async_trait]
impl AckChannel for Channel {
    async fn ack(&self, delivery_tag: u64) -> Result<(), lapin::Error> {
        self.basic_ack(delivery_tag, BasicAckOptions::default()).await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), lapin::Error> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                requeue,
                ..Default::default()
            },
        )
        .await
    }

    async fn dead_letter(
        &self,
        queue: &str,
        letter: &DeadLetter<'_>,
    ) -> Result<(), DeadLetterError> {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(2) // Persistent
            .with_content_type("application/json".into())
            .with_headers(letter.headers());
        if let Some(id) = letter.message_id {
            properties = properties.with_message_id(id.to_string().into());
        }

        // Mandatory: an unroutable copy comes back instead of being dropped.
        let confirmation = self
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                letter.body,
                properties,
            )
            .await?
            .await?;

        confirmed(confirmation)
    }
}

/// Map a publisher confirm to the outcome of a dead-letter publish.
pub fn confirmed(confirmation: Confirmation) -> Result<(), DeadLetterError> {
    match confirmation {
        Confirmation::Ack(None) => Ok(()),
        Confirmation::Ack(Some(_)) => Err(DeadLetterError::Returned),
        Confirmation::Nack(_) => Err(DeadLetterError::Nacked),
        Confirmation::NotRequested => Err(DeadLetterError::Unconfirmed),
    }
}

/// Settlement decision for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter { reason: String, attempts: u32 },
}

/// Retry ceiling and pacing for failed messages.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failed attempts before dead-lettering; 0 keeps requeueing forever.
    pub max_attempts: u32,
    pub requeue_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, requeue_delay: Duration) -> Self {
        Self {
            max_attempts,
            requeue_delay,
        }
    }

    /// Decide what to do with a message that has now failed `attempts` times.
    pub fn on_failure(&self, attempts: u32, reason: &str) -> Disposition {
        if self.max_attempts > 0 && attempts >= self.max_attempts {
            Disposition::DeadLetter {
                reason: reason.to_string(),
                attempts,
            }
        } else {
            Disposition::Requeue
        }
    }
}

/// Failure counts for messages that are being redelivered.
///
/// Entries are dropped once a message is acknowledged or dead-lettered.
#[derive(Debug, Default)]
pub struct AttemptTracker {
    failures: HashMap<String, u32>,
}

impl AttemptTracker {
    /// Record one more failure for `key` and return the running total.
    pub fn record_failure(&mut self, key: &str) -> u32 {
        let count = self.failures.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The delivery tag was never held or already settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadySettled(pub u64);

/// Per-subscription runtime handle.
///
/// Created when a queue is subscribed and dropped with its channel. Holds
/// the delivery tags awaiting a settlement decision, so each tag is acked or
/// nacked at most once.
#[derive(Debug)]
pub struct ConsumerState {
    pub queue: String,
    pub consumer_tag: String,
    pub prefetch: u16,
    pending: HashSet<u64>,
}

impl ConsumerState {
    pub fn new(queue: impl Into<String>, consumer_tag: impl Into<String>, prefetch: u16) -> Self {
        Self {
            queue: queue.into(),
            consumer_tag: consumer_tag.into(),
            prefetch,
            pending: HashSet::new(),
        }
    }

    /// Start tracking a delivery. Returns false if the tag is already held.
    pub fn hold(&mut self, delivery_tag: u64) -> bool {
        self.pending.insert(delivery_tag)
    }

    /// Claim the single settlement of a delivery.
    pub fn settle(&mut self, delivery_tag: u64) -> Result<(), AlreadySettled> {
        if self.pending.remove(&delivery_tag) {
            Ok(())
        } else {
            Err(AlreadySettled(delivery_tag))
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_requeues_until_ceiling() {
        let policy = RetryPolicy::new(3, Duration::ZERO);

        assert_eq!(policy.on_failure(1, "boom"), Disposition::Requeue);
        assert_eq!(policy.on_failure(2, "boom"), Disposition::Requeue);
        assert_eq!(
            policy.on_failure(3, "boom"),
            Disposition::DeadLetter {
                reason: "boom".to_string(),
                attempts: 3
            }
        );
    }

    #[test]
    fn test_retry_policy_unbounded() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.on_failure(10_000, "boom"), Disposition::Requeue);
    }

    #[test]
    fn test_attempt_tracker() {
        let mut tracker = AttemptTracker::default();

        assert_eq!(tracker.record_failure("a"), 1);
        assert_eq!(tracker.record_failure("a"), 2);
        assert_eq!(tracker.record_failure("b"), 1);
        assert_eq!(tracker.len(), 2);

        tracker.clear("a");
        assert_eq!(tracker.record_failure("a"), 1);
        tracker.clear("a");
        tracker.clear("b");
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_consumer_state_settles_once() {
        let mut state = ConsumerState::new("email_queue", "mail-consumer-email_queue", 1);

        assert!(state.hold(7));
        assert!(!state.hold(7));
        assert_eq!(state.in_flight(), 1);

        assert_eq!(state.settle(7), Ok(()));
        assert_eq!(state.settle(7), Err(AlreadySettled(7)));
        assert_eq!(state.settle(8), Err(AlreadySettled(8)));
        assert_eq!(state.in_flight(), 0);
    }

    #[test]
    fn test_confirmed_requires_broker_ack() {
        assert!(confirmed(Confirmation::Ack(None)).is_ok());
        assert!(matches!(
            confirmed(Confirmation::Nack(None)),
            Err(DeadLetterError::Nacked)
        ));
        assert!(matches!(
            confirmed(Confirmation::NotRequested),
            Err(DeadLetterError::Unconfirmed)
        ));
    }

    #[test]
    fn test_dead_letter_headers() {
        let letter = DeadLetter {
            original_queue: "email_queue",
            reason: "delivery failed",
            attempts: 5,
            message_id: None,
            body: b"{}",
        };

        let headers = letter.headers();
        let inner = headers.inner();
        assert_eq!(inner.len(), 3);
        assert!(inner
            .iter()
            .any(|(k, v)| k.as_str() == "x-delivery-attempts"
                && *v == AMQPValue::LongLongInt(5)));
        assert!(inner.iter().any(|(k, _)| k.as_str() == "x-original-queue"));
    }
}
