//! Mail Consumer - RabbitMQ-driven dispatcher for transactional email.
//!
//! This library provides the modules for the two binaries:
//! - `mail-consumer`: Consumes job queues and delivers rendered email
//! - `mail-enqueue`: Publishes test jobs onto those queues
//!
//! ## Architecture
//!
//! ```text
//! scheduler_jobs_queue → Reminder worker ┐
//!                                         ├→ JobRouter → Renderer → DeliveryTransport
//! email_queue → Security-code worker ────┘
//! ```
//!
//! Each queue is consumed with a prefetch of 1 and every delivery ends in
//! exactly one ack, requeue or dead-letter decision.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod queue;
pub mod render;
pub mod router;
pub mod transport;
pub mod util;
pub mod web;

// Re-export commonly used types
pub use config::{Config, TransportConfig};
pub use error::{ConfigError, ConnectionError, DeliveryError, JobError};
pub use queue::{Job, JobEnvelope, JobKind, Publisher, QueueBinding};
pub use render::{RenderedMessage, Renderer};
pub use router::{DeliveryOutcome, JobRouter};
pub use transport::DeliveryTransport;
