//! Error taxonomy.
//!
//! Connection errors are fatal at startup. Job errors are per-message and
//! always end in a settlement decision at the consumer boundary.

use thiserror::Error;

/// Failure to establish or use the broker connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to broker at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to open channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to enable publisher confirms on queue {queue}: {source}")]
    Confirm {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to set QoS on queue {queue}: {source}")]
    Qos {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to declare queue {queue}: {source}")]
    Declare {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to start consumer on queue {queue}: {source}")]
    Consume {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("broker connection is closed")]
    Closed,
}

/// Failure reported by a delivery transport.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider rejected message ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("SMTP send failed: {0}")]
    Smtp(String),

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
}

/// Per-message processing failure.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("malformed {stage}: {source}")]
    Decode {
        stage: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("rendering failed: {0}")]
    Render(#[from] RenderError),

    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("no job kind is bound to queue {queue}")]
    UnroutableKind { queue: String },
}

impl JobError {
    pub(crate) fn envelope(source: serde_json::Error) -> Self {
        JobError::Decode {
            stage: "envelope",
            source,
        }
    }

    pub(crate) fn payload(source: serde_json::Error) -> Self {
        JobError::Decode {
            stage: "payload",
            source,
        }
    }

    /// Short machine-readable label used in logs and dead-letter headers.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Decode { .. } => "decode",
            JobError::Render(_) => "render",
            JobError::Delivery(_) => "delivery",
            JobError::UnroutableKind { .. } => "unroutable",
        }
    }
}

/// Template registration or rendering failure.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to register template {name}: {source}")]
    Register {
        name: &'static str,
        #[source]
        source: Box<handlebars::TemplateError>,
    },

    #[error("failed to render template {name}: {source}")]
    Render {
        name: &'static str,
        #[source]
        source: Box<handlebars::RenderError>,
    },
}

/// Broker refused or could not confirm a dead-letter publish.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("broker nacked the dead-letter publish")]
    Nacked,

    #[error("dead-letter publish was returned as unroutable")]
    Returned,

    #[error("publisher confirms are not enabled on the channel")]
    Unconfirmed,
}

/// Invalid or missing process configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}
