//! Per-queue worker.
//!
//! One worker serves one queue: it pulls a delivery, decodes the envelope,
//! hands it to the router and settles it before pulling the next one. With
//! a prefetch of 1 the broker never has a second message of the same queue
//! outstanding, so processing within a queue is strictly sequential.

use std::fmt::Display;
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use lapin::{message::Delivery, types::AMQPValue};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::ack::{AckChannel, AttemptTracker, ConsumerState, DeadLetter, Disposition, RetryPolicy};
use super::stats::QueueStats;
use super::shutdown_requested;
use crate::queue::{JobEnvelope, QueueBinding};
use crate::router::{DeliveryOutcome, JobRouter};
use crate::util::message_key;

/// Unacknowledged messages allowed per queue.
pub const PREFETCH_COUNT: u16 = 1;

/// Broker-maintained redelivery counter (quorum queues).
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// A delivery as seen by the worker.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub message_id: Option<String>,
    /// Previous deliveries reported by the broker, when it tracks them.
    pub delivery_count: Option<u32>,
    pub body: Vec<u8>,
}

impl From<Delivery> for IncomingMessage {
    fn from(delivery: Delivery) -> Self {
        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|s| s.to_string());

        let delivery_count = delivery.properties.headers().as_ref().and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(k, _)| k.as_str() == DELIVERY_COUNT_HEADER)
                .and_then(|(_, v)| as_count(v))
        });

        IncomingMessage {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            message_id,
            delivery_count,
            body: delivery.data,
        }
    }
}

fn as_count(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        _ => None,
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown was requested; the in-flight message was settled first.
    Shutdown,
    /// The delivery stream ended, usually because the channel closed.
    StreamClosed,
}

/// Consumer for a single queue. Cheap to clone; clones share counters.
#[derive(Clone)]
pub struct QueueWorker {
    binding: QueueBinding,
    router: Arc<JobRouter>,
    policy: RetryPolicy,
    attempts: Arc<Mutex<AttemptTracker>>,
    stats: Arc<QueueStats>,
}

impl QueueWorker {
    pub fn new(binding: QueueBinding, router: Arc<JobRouter>, policy: RetryPolicy) -> Self {
        let stats = Arc::new(QueueStats::new(binding.queue.clone()));
        Self {
            binding,
            router,
            policy,
            attempts: Arc::new(Mutex::new(AttemptTracker::default())),
            stats,
        }
    }

    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    pub fn queue(&self) -> &str {
        &self.binding.queue
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }

    /// Consume `deliveries` until shutdown or until the stream ends.
    ///
    /// Shutdown is only observed between messages, so a message being
    /// processed is always settled before the worker returns.
    pub async fn run<C, S, E>(
        &self,
        channel: &C,
        mut deliveries: S,
        consumer_tag: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> WorkerExit
    where
        C: AckChannel,
        S: Stream<Item = Result<IncomingMessage, E>> + Unpin,
        E: Display,
    {
        let mut state = ConsumerState::new(self.queue(), consumer_tag, PREFETCH_COUNT);

        info!(
            queue = %state.queue,
            consumer_tag = %state.consumer_tag,
            prefetch_count = state.prefetch,
            "queue_worker_started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => {
                    info!(queue = %state.queue, in_flight = state.in_flight(), "queue_worker_stopping");
                    return WorkerExit::Shutdown;
                }

                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(message)) => self.handle(channel, &mut state, message).await,
                        Some(Err(e)) => {
                            error!(queue = %state.queue, error = %e, "rabbitmq_delivery_error");
                        }
                        None => {
                            warn!(queue = %state.queue, "rabbitmq_consumer_closed");
                            return WorkerExit::StreamClosed;
                        }
                    }
                }
            }
        }
    }

    /// Process one delivery and settle it.
    async fn handle<C: AckChannel>(
        &self,
        channel: &C,
        state: &mut ConsumerState,
        message: IncomingMessage,
    ) {
        let queue = self.queue();
        let key = message_key(message.message_id.as_deref(), &message.body);

        if !state.hold(message.delivery_tag) {
            error!(
                queue = %queue,
                delivery_tag = message.delivery_tag,
                "rabbitmq_duplicate_delivery_tag"
            );
            return;
        }
        self.stats.record_received();

        info!(
            queue = %queue,
            message_id = %key,
            delivery_tag = message.delivery_tag,
            redelivered = message.redelivered,
            body_length = message.body.len(),
            "rabbitmq_job_received"
        );

        let disposition = match self.process(&message).await {
            DeliveryOutcome::Delivered { job_id } => {
                self.forget(&key);
                debug!(queue = %queue, job_id = %job_id, "job_completed");
                Disposition::Ack
            }
            DeliveryOutcome::Failed { job_id, error } => {
                let attempts = self.record_failure(&key, message.delivery_count);
                error!(
                    queue = %queue,
                    job_id = %job_id.as_deref().unwrap_or(&key),
                    delivery_tag = message.delivery_tag,
                    error_kind = error.kind(),
                    error = %error,
                    attempt = attempts,
                    max_attempts = self.policy.max_attempts,
                    body_preview = %String::from_utf8_lossy(
                        &message.body[..message.body.len().min(500)]
                    ),
                    "job_failed"
                );

                let disposition = self.policy.on_failure(attempts, &error.to_string());
                if matches!(disposition, Disposition::DeadLetter { .. }) {
                    self.forget(&key);
                }
                disposition
            }
        };

        self.settle(channel, state, &message, disposition).await;
    }

    /// Decode the envelope and route it. Decode failures never reach the router.
    pub async fn process(&self, message: &IncomingMessage) -> DeliveryOutcome {
        let envelope = match JobEnvelope::decode(&message.body) {
            Ok(envelope) => envelope,
            Err(error) => return DeliveryOutcome::Failed { job_id: None, error },
        };

        if envelope.pattern != self.binding.kind.pattern() {
            debug!(
                queue = %self.binding.queue,
                pattern = %envelope.pattern,
                expected = self.binding.kind.pattern(),
                "envelope_pattern_mismatch"
            );
        }

        self.router.route(&self.binding.queue, envelope.data).await
    }

    /// Apply the single settlement decision for a delivery.
    async fn settle<C: AckChannel>(
        &self,
        channel: &C,
        state: &mut ConsumerState,
        message: &IncomingMessage,
        disposition: Disposition,
    ) {
        let queue = self.queue();
        let delivery_tag = message.delivery_tag;

        if let Err(settled) = state.settle(delivery_tag) {
            error!(
                queue = %queue,
                delivery_tag = settled.0,
                disposition = ?disposition,
                "rabbitmq_settlement_already_recorded"
            );
            return;
        }
        self.stats.record_settled();

        match disposition {
            Disposition::Ack => self.ack(channel, delivery_tag).await,
            Disposition::Requeue => self.requeue(channel, delivery_tag).await,
            Disposition::DeadLetter { reason, attempts } => {
                let dead_letter_queue = self.binding.dead_letter_queue();
                let letter = DeadLetter {
                    original_queue: queue,
                    reason: &reason,
                    attempts,
                    message_id: message.message_id.as_deref(),
                    body: &message.body,
                };

                match channel.dead_letter(&dead_letter_queue, &letter).await {
                    Ok(()) => {
                        warn!(
                            queue = %queue,
                            dead_letter_queue = %dead_letter_queue,
                            delivery_tag = delivery_tag,
                            attempts = attempts,
                            reason = %reason,
                            "job_dead_lettered"
                        );
                        self.stats.record_dead_lettered();
                        self.ack(channel, delivery_tag).await;
                    }
                    Err(e) => {
                        error!(
                            queue = %queue,
                            dead_letter_queue = %dead_letter_queue,
                            error = %e,
                            "rabbitmq_dead_letter_failed"
                        );
                        self.requeue(channel, delivery_tag).await;
                    }
                }
            }
        }
    }

    async fn ack<C: AckChannel>(&self, channel: &C, delivery_tag: u64) {
        match channel.ack(delivery_tag).await {
            Ok(()) => {
                self.stats.record_acked();
                info!(queue = %self.queue(), delivery_tag = delivery_tag, "rabbitmq_job_acked");
            }
            Err(e) => {
                error!(
                    queue = %self.queue(),
                    delivery_tag = delivery_tag,
                    error = %e,
                    "rabbitmq_ack_failed"
                );
            }
        }
    }

    async fn requeue<C: AckChannel>(&self, channel: &C, delivery_tag: u64) {
        if !self.policy.requeue_delay.is_zero() {
            sleep(self.policy.requeue_delay).await;
        }

        match channel.nack(delivery_tag, true).await {
            Ok(()) => {
                self.stats.record_requeued();
                info!(queue = %self.queue(), delivery_tag = delivery_tag, "rabbitmq_job_requeued");
            }
            Err(e) => {
                error!(
                    queue = %self.queue(),
                    delivery_tag = delivery_tag,
                    error = %e,
                    "rabbitmq_nack_failed"
                );
            }
        }
    }

    /// Count a failure, taking the broker's own counter into account.
    fn record_failure(&self, key: &str, delivery_count: Option<u32>) -> u32 {
        let tracked = match self.attempts.lock() {
            Ok(mut tracker) => tracker.record_failure(key),
            Err(poisoned) => poisoned.into_inner().record_failure(key),
        };
        let reported = delivery_count.map(|n| n.saturating_add(1)).unwrap_or(0);
        tracked.max(reported)
    }

    fn forget(&self, key: &str) {
        match self.attempts.lock() {
            Ok(mut tracker) => tracker.clear(key),
            Err(poisoned) => poisoned.into_inner().clear(key),
        }
    }
}
