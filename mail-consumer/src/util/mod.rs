//! Small helpers shared by the consumer and the enqueue tool.

pub mod fingerprint;

pub use fingerprint::{message_key, redact_url};
