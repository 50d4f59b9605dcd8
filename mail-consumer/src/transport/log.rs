//! Transport that records the send instead of delivering it.

use async_trait::async_trait;
use tracing::info;

use super::DeliveryTransport;
use crate::error::DeliveryError;
use crate::render::RenderedMessage;

/// Development transport: logs the message and reports success.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl DeliveryTransport for LogTransport {
    async fn send(&self, message: &RenderedMessage) -> Result<(), DeliveryError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            html_length = message.html.len(),
            "log_transport_send"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
