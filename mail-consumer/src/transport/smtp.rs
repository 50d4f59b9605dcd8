//! SMTP transport using lettre.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, error, info};

use super::{DeliveryTransport, Sender};
use crate::error::{ConfigError, DeliveryError};
use crate::render::RenderedMessage;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// STARTTLS relay when true; plain connection otherwise (local dev servers).
    pub use_tls: bool,
    pub sender: Sender,
}

/// Delivers messages through an SMTP relay.
pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    host: String,
}

impl SmtpTransport {
    pub fn new(config: SmtpConfig) -> Result<Self, ConfigError> {
        let credentials = Credentials::new(config.username.clone(), config.password.clone());

        let transport = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|_| ConfigError::Invalid {
                    name: "SMTP_HOST",
                    value: config.host.clone(),
                })?
                .port(config.port)
                .credentials(credentials)
                .build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                .port(config.port)
                .credentials(credentials)
                .build()
        };

        let from = format!("{} <{}>", config.sender.name, config.sender.email)
            .parse::<Mailbox>()
            .map_err(|_| ConfigError::Invalid {
                name: "FROM_EMAIL",
                value: config.sender.email.clone(),
            })?;

        Ok(Self {
            transport,
            from,
            host: config.host,
        })
    }

    fn build_message(&self, message: &RenderedMessage) -> Result<Message, DeliveryError> {
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|e: lettre::address::AddressError| DeliveryError::InvalidAddress {
                address: message.to.clone(),
                reason: e.to_string(),
            })?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.as_str())
            .header(ContentType::TEXT_HTML)
            .body(message.html.clone())
            .map_err(|e| DeliveryError::Smtp(format!("failed to build message: {e}")))
    }
}

#[async_trait]
impl DeliveryTransport for SmtpTransport {
    async fn send(&self, message: &RenderedMessage) -> Result<(), DeliveryError> {
        debug!(to = %message.to, host = %self.host, "smtp_send_starting");

        let email = self.build_message(message)?;

        let response = self.transport.send(email).await.map_err(|e| {
            error!(to = %message.to, error = %e, "smtp_send_failed");
            DeliveryError::Smtp(e.to_string())
        })?;

        info!(
            to = %message.to,
            code = %response.code(),
            "smtp_send_accepted"
        );

        Ok(())
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SmtpConfig {
        SmtpConfig {
            host: "localhost".to_string(),
            port: 1025,
            username: "user".to_string(),
            password: "pass".to_string(),
            use_tls: false,
            sender: Sender {
                email: "noreply@clinic.test".to_string(),
                name: "Identiclinic".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_build_message_rejects_invalid_recipient() {
        let transport = SmtpTransport::new(config()).unwrap();
        let message = RenderedMessage {
            to: "not-an-address".to_string(),
            subject: "Appointment reminder".to_string(),
            html: "<p>hi</p>".to_string(),
        };

        match transport.build_message(&message) {
            Err(DeliveryError::InvalidAddress { address, .. }) => {
                assert_eq!(address, "not-an-address")
            }
            Err(e) => panic!("Expected InvalidAddress, got {e:?}"),
            Ok(_) => panic!("Expected InvalidAddress, got a message"),
        }
    }

    #[tokio::test]
    async fn test_build_message_valid() {
        let transport = SmtpTransport::new(config()).unwrap();
        let message = RenderedMessage {
            to: "p@example.com".to_string(),
            subject: "Appointment reminder".to_string(),
            html: "<p>hi</p>".to_string(),
        };

        assert!(transport.build_message(&message).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_sender_is_config_error() {
        let mut config = config();
        config.sender.email = "broken".to_string();

        assert!(matches!(
            SmtpTransport::new(config),
            Err(ConfigError::Invalid { name: "FROM_EMAIL", .. })
        ));
    }
}
