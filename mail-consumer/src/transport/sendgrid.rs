//! SendGrid v3 mail-send transport.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{DeliveryTransport, Sender};
use crate::error::DeliveryError;
use crate::render::RenderedMessage;

/// Production SendGrid API base URL.
pub const SENDGRID_API_URL: &str = "https://api.sendgrid.com/v3";

#[derive(Debug, Clone)]
pub struct SendGridConfig {
    pub api_key: String,
    pub sender: Sender,
    pub api_url: String,
}

impl SendGridConfig {
    pub fn new(api_key: String, sender: Sender) -> Self {
        Self {
            api_key,
            sender,
            api_url: SENDGRID_API_URL.to_string(),
        }
    }
}

/// Delivers messages through the SendGrid HTTP API.
pub struct SendGridTransport {
    config: SendGridConfig,
    client: Client,
}

impl SendGridTransport {
    pub fn new(config: SendGridConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn build_request(&self, message: &RenderedMessage) -> SendGridRequest {
        SendGridRequest {
            personalizations: vec![Personalization {
                to: vec![EmailAddress {
                    email: message.to.clone(),
                    name: None,
                }],
            }],
            from: EmailAddress {
                email: self.config.sender.email.clone(),
                name: Some(self.config.sender.name.clone()),
            },
            subject: message.subject.clone(),
            content: vec![Content {
                content_type: "text/html".to_string(),
                value: message.html.clone(),
            }],
        }
    }
}

// SendGrid API request/response structures

#[derive(Debug, Serialize)]
struct SendGridRequest {
    personalizations: Vec<Personalization>,
    from: EmailAddress,
    subject: String,
    content: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Personalization {
    to: Vec<EmailAddress>,
}

#[derive(Debug, Serialize)]
struct EmailAddress {
    email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(rename = "type")]
    content_type: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SendGridError {
    errors: Vec<SendGridErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct SendGridErrorDetail {
    message: String,
}

/// Collapse a SendGrid error body into a single line.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<SendGridError>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed
            .errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join(", "),
        _ => body.to_string(),
    }
}

#[async_trait]
impl DeliveryTransport for SendGridTransport {
    async fn send(&self, message: &RenderedMessage) -> Result<(), DeliveryError> {
        let request = self.build_request(message);

        debug!(to = %message.to, subject = %message.subject, "sendgrid_send_starting");

        let response = self
            .client
            .post(format!("{}/mail/send", self.config.api_url))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status.is_success() {
            info!(to = %message.to, message_id = ?message_id, "sendgrid_send_accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let reason = error_message(&body);
        error!(
            to = %message.to,
            status = status.as_u16(),
            error = %reason,
            "sendgrid_send_rejected"
        );

        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            message: reason,
        })
    }

    fn name(&self) -> &'static str {
        "sendgrid"
    }
}
