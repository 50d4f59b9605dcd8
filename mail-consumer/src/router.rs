//! Job routing.
//!
//! Given the queue a message arrived on and the envelope's `data`, the router
//! decodes the payload for that queue's job kind, renders it and makes
//! exactly one transport call.
//!
//! ## Processing Flow
//!
//! ```text
//! (queue, data) → Job::decode → Renderer::render → DeliveryTransport::send
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use crate::error::JobError;
use crate::queue::{Job, JobKind, QueueBinding};
use crate::render::Renderer;
use crate::transport::DeliveryTransport;

/// Outcome of one delivery attempt.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered { job_id: String },
    Failed { job_id: Option<String>, error: JobError },
}

impl DeliveryOutcome {
    fn failed(job_id: Option<String>, error: JobError) -> Self {
        DeliveryOutcome::Failed { job_id, error }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// Stateless dispatcher shared by all queue workers.
pub struct JobRouter {
    routes: HashMap<String, JobKind>,
    renderer: Renderer,
    transport: Arc<dyn DeliveryTransport>,
}

impl JobRouter {
    pub fn new(
        bindings: &[QueueBinding],
        renderer: Renderer,
        transport: Arc<dyn DeliveryTransport>,
    ) -> Self {
        let routes = bindings
            .iter()
            .map(|b| (b.queue.clone(), b.kind))
            .collect();

        Self {
            routes,
            renderer,
            transport,
        }
    }

    /// Job kind bound to `queue`, if any.
    pub fn kind_for(&self, queue: &str) -> Option<JobKind> {
        self.routes.get(queue).copied()
    }

    /// Decode, render and deliver one job.
    pub async fn route(&self, queue: &str, data: serde_json::Value) -> DeliveryOutcome {
        let Some(kind) = self.kind_for(queue) else {
            error!(queue = %queue, "unroutable_queue");
            return DeliveryOutcome::failed(
                None,
                JobError::UnroutableKind {
                    queue: queue.to_string(),
                },
            );
        };

        let job = match Job::decode(kind, data) {
            Ok(job) => job,
            Err(e) => return DeliveryOutcome::failed(None, e),
        };

        let job_id = job.job_id();
        info!(queue = %queue, kind = kind.as_str(), job_id = %job_id, "job_routing");

        let message = match self.renderer.render(&job) {
            Ok(message) => message,
            Err(e) => return DeliveryOutcome::failed(Some(job_id), e.into()),
        };

        match self.transport.send(&message).await {
            Ok(()) => {
                info!(
                    queue = %queue,
                    job_id = %job_id,
                    to = %message.to,
                    transport = self.transport.name(),
                    "job_delivered"
                );
                DeliveryOutcome::Delivered { job_id }
            }
            Err(e) => DeliveryOutcome::failed(Some(job_id), e.into()),
        }
    }
}
