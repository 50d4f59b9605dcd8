//! Queue module for RabbitMQ message types and publishing.
//!
//! This module provides:
//! - The job envelope and the two job payloads
//! - Queue bindings mapping a queue name to its job kind
//! - Async publisher for enqueueing jobs
//!
//! ## Architecture
//!
//! ```text
//! Scheduler → scheduler_jobs_queue ┐
//!                                  ├→ Consumer → Router → Transport
//! Auth API  → email_queue ─────────┘
//! ```

pub mod publisher;
pub mod types;

pub use publisher::Publisher;
pub use types::{
    dead_letter_queue, Job, JobEnvelope, JobKind, QueueBinding, ReminderJob, SecurityCodeJob,
    SecurityCodeKind, DEAD_LETTER_SUFFIX, DEFAULT_REMINDER_QUEUE, DEFAULT_SECURITY_QUEUE,
    PASSWORD_RESET_SUBJECT, REMINDER_PATTERN, SECURITY_CODE_PATTERN, VERIFICATION_SUBJECT,
};
