//! RabbitMQ consumer supervisor.
//!
//! Connects to the broker, subscribes one worker per configured queue and
//! keeps them running until shutdown. If the connection drops after
//! startup, the supervisor reconnects with bounded exponential backoff and
//! resubscribes every queue.

pub mod ack;
pub mod stats;
pub mod worker;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use rand::Rng;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, warn};

pub use ack::{AckChannel, ConsumerState, DeadLetter, Disposition, RetryPolicy};
pub use stats::{QueueStats, QueueStatsSnapshot};
pub use worker::{IncomingMessage, QueueWorker, WorkerExit, PREFETCH_COUNT};

use crate::broker::{Broker, Subscription};
use crate::config::Config;
use crate::error::ConnectionError;
use crate::render::Renderer;
use crate::router::JobRouter;
use crate::transport;
use crate::web::{self, AppState};

/// How a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Run the consumer until `shutdown` flips to true.
///
/// A broker that cannot be reached at startup is an error. So is a lost
/// connection that cannot be re-established within the reconnect budget.
pub async fn run(config: Config, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let transport =
        transport::from_config(&config.transport).context("Failed to create delivery transport")?;

    info!(transport = transport.name(), "delivery_transport_ready");

    let bindings = config.bindings();
    let router = Arc::new(JobRouter::new(
        &bindings,
        Renderer::new(&config.brand_name).context("Failed to register email templates")?,
        transport,
    ));
    let policy = RetryPolicy::new(
        config.max_delivery_attempts,
        Duration::from_millis(config.requeue_delay_ms),
    );
    let workers: Vec<QueueWorker> = bindings
        .into_iter()
        .map(|binding| QueueWorker::new(binding, Arc::clone(&router), policy.clone()))
        .collect();

    let health = config.health_port.map(|port| {
        let state = AppState::new(workers.iter().map(QueueWorker::stats).collect());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = web::serve(port, state, shutdown).await {
                error!(error = %e, "health_server_failed");
            }
        })
    });

    let result = supervise(&config, &workers, &mut shutdown).await;

    if let Some(handle) = health {
        if result.is_ok() {
            let _ = handle.await;
        } else {
            handle.abort();
        }
    }

    result
}

async fn supervise(
    config: &Config,
    workers: &[QueueWorker],
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let (mut broker, mut subscriptions) = open(&config.amqp_url, workers)
        .await
        .context("Failed to start consumer")?;

    info!(queues = workers.len(), "worker_ready");

    loop {
        let end = serve(sessions(workers, subscriptions), shutdown.clone()).await;
        broker.close().await;

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Disconnected => {
                warn!(endpoint = %broker.endpoint(), "rabbitmq_connection_lost");
                let policy = ReconnectPolicy::from_config(config);
                match reconnect(policy, shutdown, || open(&config.amqp_url, workers))
                    .await
                    .context("Failed to reconnect to RabbitMQ")?
                {
                    Some((next, subs)) => {
                        broker = next;
                        subscriptions = subs;
                    }
                    None => break,
                }
            }
        }
    }

    info!("worker_shutdown_complete");
    Ok(())
}

/// Connect and subscribe every worker's queue, closing on partial failure.
async fn open(
    url: &str,
    workers: &[QueueWorker],
) -> Result<(Broker, Vec<Subscription>), ConnectionError> {
    let mut broker = Broker::connect(url).await?;
    let mut subscriptions = Vec::with_capacity(workers.len());

    for worker in workers {
        match broker.subscribe(worker.binding()).await {
            Ok(subscription) => subscriptions.push(subscription),
            Err(e) => {
                broker.close().await;
                return Err(e);
            }
        }
    }

    Ok((broker, subscriptions))
}

/// One worker paired with the channel and deliveries it consumes.
struct Session<C, E> {
    worker: QueueWorker,
    channel: C,
    deliveries: BoxStream<'static, Result<IncomingMessage, E>>,
    consumer_tag: String,
}

fn sessions(
    workers: &[QueueWorker],
    subscriptions: Vec<Subscription>,
) -> Vec<Session<lapin::Channel, lapin::Error>> {
    workers
        .iter()
        .zip(subscriptions)
        .map(|(worker, subscription)| Session {
            worker: worker.clone(),
            channel: subscription.channel,
            deliveries: subscription
                .consumer
                .map(|delivery| delivery.map(IncomingMessage::from))
                .boxed(),
            consumer_tag: subscription.consumer_tag,
        })
        .collect()
}

/// Drive one worker task per session until shutdown or a lost stream.
///
/// When any stream ends the remaining workers are stopped too, so the
/// whole set is resubscribed together.
async fn serve<C, E>(sessions: Vec<Session<C, E>>, mut shutdown: watch::Receiver<bool>) -> SessionEnd
where
    C: AckChannel + 'static,
    E: Display + Send + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    for session in sessions {
        let stop = stop_rx.clone();

        tasks.spawn(async move {
            let Session {
                worker,
                channel,
                deliveries,
                consumer_tag,
            } = session;
            worker.run(&channel, deliveries, &consumer_tag, stop).await
        });
    }

    let mut end = SessionEnd::Shutdown;
    let mut stopping = false;

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown), if !stopping => {
                info!("worker_stopping");
                stopping = true;
                let _ = stop_tx.send(true);
            }

            joined = tasks.join_next() => {
                let lost = match joined {
                    None => break,
                    Some(Ok(WorkerExit::Shutdown)) => false,
                    Some(Ok(WorkerExit::StreamClosed)) => true,
                    Some(Err(e)) => {
                        error!(error = %e, "queue_worker_panicked");
                        true
                    }
                };

                if lost && !stopping {
                    end = SessionEnd::Disconnected;
                    stopping = true;
                    let _ = stop_tx.send(true);
                }
            }
        }
    }

    end
}

/// Reconnect budget and backoff bounds.
#[derive(Debug, Clone, Copy)]
struct ReconnectPolicy {
    max_attempts: u32,
    base_ms: u64,
    cap_ms: u64,
}

impl ReconnectPolicy {
    fn from_config(config: &Config) -> Self {
        let (base_ms, cap_ms) = config.reconnect_backoff_ms;
        Self {
            max_attempts: config.reconnect_max_attempts,
            base_ms,
            cap_ms,
        }
    }
}

/// Re-establish the connection after a post-start drop by calling `open`
/// until it succeeds or the attempt budget runs out.
///
/// Returns `Ok(None)` when shutdown is requested while waiting.
async fn reconnect<T, F, Fut>(
    policy: ReconnectPolicy,
    shutdown: &mut watch::Receiver<bool>,
    mut open: F,
) -> Result<Option<T>, ConnectionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectionError>>,
{
    let max_attempts = policy.max_attempts;
    let mut last_error = ConnectionError::Closed;

    for attempt in 1..=max_attempts {
        let delay = with_jitter(backoff_delay(attempt, policy.base_ms, policy.cap_ms));

        warn!(
            attempt = attempt,
            max_attempts = max_attempts,
            delay_ms = delay.as_millis() as u64,
            "rabbitmq_reconnecting"
        );

        tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => return Ok(None),
            _ = sleep(delay) => {}
        }

        match open().await {
            Ok(opened) => {
                info!(attempt = attempt, "rabbitmq_reconnected");
                return Ok(Some(opened));
            }
            Err(e) => {
                warn!(attempt = attempt, error = %e, "rabbitmq_reconnect_failed");
                last_error = e;
            }
        }
    }

    Err(last_error)
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `cap`.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let factor = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
}

/// Add up to 25% random jitter.
fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 4;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Resolve once shutdown has been requested or the sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobKind;
    use crate::router::tests::RecordingTransport;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::timeout;
    use worker::tests::{message, reminder_body, worker_with, EventLog, RecordingChannel};

    fn session(
        kind: JobKind,
        events: &EventLog,
        deliveries: BoxStream<'static, Result<IncomingMessage, Infallible>>,
    ) -> Session<RecordingChannel, Infallible> {
        Session {
            worker: worker_with(Arc::new(RecordingTransport::default()), kind, 5),
            channel: RecordingChannel::with_log(Arc::clone(events)),
            deliveries,
            consumer_tag: format!("test-{kind:?}"),
        }
    }

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_ms: 1,
            cap_ms: 2,
        }
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        assert_eq!(backoff_delay(1, 500, 30_000), Duration::from_millis(500));
        assert_eq!(backoff_delay(2, 500, 30_000), Duration::from_millis(1000));
        assert_eq!(backoff_delay(4, 500, 30_000), Duration::from_millis(4000));
        assert_eq!(backoff_delay(10, 500, 30_000), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(200, 500, 30_000), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(0, 500, 30_000), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = with_jitter(base);
            assert!(d >= base && d <= Duration::from_millis(1250));
        }
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_shutdown_requested_sees_current_value() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        shutdown_requested(&mut rx).await;
    }

    #[tokio::test]
    async fn test_shutdown_requested_on_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        shutdown_requested(&mut rx).await;
    }

    #[tokio::test]
    async fn test_closed_stream_stops_sibling_and_disconnects() {
        let events: EventLog = Arc::default();
        let closing = session(
            JobKind::Reminder,
            &events,
            futures::stream::iter(vec![Ok(message(1, &reminder_body("a@example.com")))]).boxed(),
        );
        let idle = session(JobKind::SecurityCode, &events, futures::stream::pending().boxed());
        let (_tx, rx) = watch::channel(false);

        let end = timeout(Duration::from_secs(5), serve(vec![closing, idle], rx))
            .await
            .unwrap();

        assert_eq!(end, SessionEnd::Disconnected);
        assert_eq!(*events.lock().unwrap(), vec!["ack:1".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_worker() {
        let events: EventLog = Arc::default();
        let sessions = vec![
            session(JobKind::Reminder, &events, futures::stream::pending().boxed()),
            session(JobKind::SecurityCode, &events, futures::stream::pending().boxed()),
        ];
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
            // Keep the sender alive until the session has wound down.
            sleep(Duration::from_secs(5)).await;
        });

        let end = timeout(Duration::from_secs(5), serve(sessions, rx))
            .await
            .unwrap();

        assert_eq!(end, SessionEnd::Shutdown);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_stops_on_shutdown_during_backoff() {
        let (tx, mut rx) = watch::channel(false);
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = ReconnectPolicy {
            max_attempts: 3,
            base_ms: 60_000,
            cap_ms: 60_000,
        };

        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let result = timeout(
            Duration::from_secs(5),
            reconnect(policy, &mut rx, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ConnectionError>(())
            }),
        )
        .await
        .unwrap();

        assert!(matches!(result, Ok(None)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reconnect_exhausted_budget_is_error() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result = reconnect(fast_policy(2), &mut rx, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ConnectionError::Closed)
        })
        .await;

        assert!(matches!(result, Err(ConnectionError::Closed)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reconnect_zero_budget_fails_without_trying() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result = reconnect(fast_policy(0), &mut rx, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ConnectionError>(())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reconnect_succeeds_on_later_attempt() {
        let (_tx, mut rx) = watch::channel(false);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result = reconnect(fast_policy(5), &mut rx, move || async move {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(ConnectionError::Closed),
                _ => Ok("session"),
            }
        })
        .await;

        assert!(matches!(result, Ok(Some("session"))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_open_unreachable_broker_fails() {
        let config = Config::from_source(|name| match name {
            "MAIL_TRANSPORT" => Some("log".to_string()),
            "AMQP_URL" => Some("amqp://127.0.0.1:1/%2f".to_string()),
            _ => None,
        })
        .unwrap();
        let (_tx, rx) = watch::channel(false);

        let err = run(config, rx).await.unwrap_err();
        assert!(err.to_string().contains("Failed to start consumer"));
    }
}
