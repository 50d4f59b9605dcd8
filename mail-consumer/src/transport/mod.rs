//! Delivery transports.
//!
//! The consumer only needs one call per routed job:
//! `send(message) -> Ok | DeliveryError`. Transports own their own
//! connections and credentials; the router invokes them but never owns
//! their lifecycle.

mod log;
mod sendgrid;
mod smtp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TransportConfig;
use crate::error::{ConfigError, DeliveryError};
use crate::render::RenderedMessage;

pub use self::log::LogTransport;
pub use sendgrid::{SendGridConfig, SendGridTransport};
pub use smtp::{SmtpConfig, SmtpTransport};

/// Sender identity configured out-of-band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub email: String,
    pub name: String,
}

/// Sends a rendered message to its recipient.
///
/// Implementations never retry internally; a failure is reported once and
/// the consumer decides whether the message is redelivered.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn send(&self, message: &RenderedMessage) -> Result<(), DeliveryError>;

    /// Transport name for logging.
    fn name(&self) -> &'static str;
}

/// Build the transport selected by configuration.
pub fn from_config(config: &TransportConfig) -> Result<Arc<dyn DeliveryTransport>, ConfigError> {
    let transport: Arc<dyn DeliveryTransport> = match config {
        TransportConfig::SendGrid(config) => Arc::new(SendGridTransport::new(config.clone())),
        TransportConfig::Smtp(config) => Arc::new(SmtpTransport::new(config.clone())?),
        TransportConfig::Log => Arc::new(LogTransport),
    };
    Ok(transport)
}
