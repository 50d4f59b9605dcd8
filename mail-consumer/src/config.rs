//! Configuration module for environment variable parsing.
//!
//! All configuration comes from environment variables. Broker and retry
//! settings fall back to defaults; transport credentials and the sender
//! address are mandatory and fail startup when missing.

use std::env;

use tracing::warn;

use crate::error::ConfigError;
use crate::queue::{JobKind, QueueBinding, DEFAULT_REMINDER_QUEUE, DEFAULT_SECURITY_QUEUE};
use crate::transport::{SendGridConfig, Sender, SmtpConfig};

/// Selected delivery transport with its credentials.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    SendGrid(SendGridConfig),
    Smtp(SmtpConfig),
    /// Log-only transport for local development.
    Log,
}

impl TransportConfig {
    pub fn name(&self) -> &'static str {
        match self {
            TransportConfig::SendGrid(_) => "sendgrid",
            TransportConfig::Smtp(_) => "smtp",
            TransportConfig::Log => "log",
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// RabbitMQ connection URL
    pub amqp_url: String,

    /// Queue carrying appointment reminders
    pub reminder_queue: String,

    /// Queue carrying verification and password-reset codes
    pub security_queue: String,

    /// Failed attempts before a message is dead-lettered (0 = never)
    pub max_delivery_attempts: u32,

    /// Pause before a negative-ack with requeue, in milliseconds
    pub requeue_delay_ms: u64,

    /// Reconnect attempts after the connection drops post-start
    pub reconnect_max_attempts: u32,

    /// Exponential backoff base and cap in milliseconds (base, cap)
    pub reconnect_backoff_ms: (u64, u64),

    /// Port for the health endpoint; disabled when unset
    pub health_port: Option<u16>,

    /// Brand shown in template header and footer
    pub brand_name: String,

    /// Delivery transport and credentials
    pub transport: TransportConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_source<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let brand_name = get("BRAND_NAME").unwrap_or_else(|| "Identiclinic".to_string());
        let transport = transport_config(&get, &brand_name)?;

        let reminder_queue =
            get("REMINDER_QUEUE").unwrap_or_else(|| DEFAULT_REMINDER_QUEUE.to_string());
        let security_queue =
            get("SECURITY_QUEUE").unwrap_or_else(|| DEFAULT_SECURITY_QUEUE.to_string());

        // Routing is by queue name, so the two kinds need distinct queues.
        if reminder_queue == security_queue {
            return Err(ConfigError::Invalid {
                name: "SECURITY_QUEUE",
                value: security_queue,
            });
        }

        Ok(Config {
            amqp_url: get("AMQP_URL").unwrap_or_else(|| "amqp://localhost:5672/%2f".to_string()),

            reminder_queue,

            security_queue,

            max_delivery_attempts: parse_or(&get, "MAX_DELIVERY_ATTEMPTS", 5),

            requeue_delay_ms: parse_or(&get, "REQUEUE_DELAY_MS", 1000),

            reconnect_max_attempts: parse_or(&get, "RECONNECT_MAX_ATTEMPTS", 5),

            reconnect_backoff_ms: parse_range(&get, "RECONNECT_BACKOFF_MS", (500, 30_000)),

            health_port: parse_opt(&get, "HEALTH_PORT"),

            brand_name,

            transport,
        })
    }

    /// Queue bindings in subscription order.
    pub fn bindings(&self) -> Vec<QueueBinding> {
        vec![
            QueueBinding::new(self.reminder_queue.clone(), JobKind::Reminder),
            QueueBinding::new(self.security_queue.clone(), JobKind::SecurityCode),
        ]
    }
}

fn transport_config<F>(get: &F, brand_name: &str) -> Result<TransportConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let selected = get("MAIL_TRANSPORT").unwrap_or_else(|| "sendgrid".to_string());

    match selected.trim().to_ascii_lowercase().as_str() {
        "log" => Ok(TransportConfig::Log),
        "sendgrid" => {
            let api_key = required(get, "SENDGRID_API_KEY")?;
            let sender = sender(get, brand_name)?;
            Ok(TransportConfig::SendGrid(SendGridConfig::new(api_key, sender)))
        }
        "smtp" => {
            let host = required(get, "SMTP_HOST")?;
            let port = match get("SMTP_PORT") {
                Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    name: "SMTP_PORT",
                    value: raw.clone(),
                })?,
                None => 587,
            };
            Ok(TransportConfig::Smtp(SmtpConfig {
                host,
                port,
                username: required(get, "SMTP_USER")?,
                password: required(get, "SMTP_PASS")?,
                use_tls: get("SMTP_USE_TLS")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(true),
                sender: sender(get, brand_name)?,
            }))
        }
        _ => Err(ConfigError::Invalid {
            name: "MAIL_TRANSPORT",
            value: selected,
        }),
    }
}

fn sender<F>(get: &F, brand_name: &str) -> Result<Sender, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(Sender {
        email: required(get, "FROM_EMAIL")?,
        name: get("FROM_NAME").unwrap_or_else(|| brand_name.to_string()),
    })
}

/// Read a variable that must be present and non-blank.
fn required<F>(get: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse_or<F, T>(get: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(env_var = name, value = %raw, "Invalid number, using default");
            default
        }),
        None => default,
    }
}

/// Parse an optional value; an unparsable one is treated as unset.
fn parse_opt<F, T>(get: &F, name: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = get(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid number, leaving unset");
            None
        }
    }
}

/// Parse a comma-separated range like "500,30000" into a tuple.
fn parse_range<F>(get: &F, name: &str, default: (u64, u64)) -> (u64, u64)
where
    F: Fn(&str) -> Option<String>,
{
    let raw = match get(name) {
        Some(v) => v,
        None => return default,
    };

    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 2 {
        warn!(env_var = name, value = %raw, "Invalid range format, using default");
        return default;
    }

    let min = parts[0].trim().parse::<u64>();
    let max = parts[1].trim().parse::<u64>();

    match (min, max) {
        (Ok(min), Ok(max)) if min <= max => (min, max),
        _ => {
            warn!(env_var = name, value = %raw, "Invalid range values, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn source(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_with_log_transport() {
        let config = Config::from_source(source(&[("MAIL_TRANSPORT", "log")])).unwrap();

        assert_eq!(config.amqp_url, "amqp://localhost:5672/%2f");
        assert_eq!(config.reminder_queue, "scheduler_jobs_queue");
        assert_eq!(config.security_queue, "email_queue");
        assert_eq!(config.max_delivery_attempts, 5);
        assert_eq!(config.requeue_delay_ms, 1000);
        assert_eq!(config.reconnect_backoff_ms, (500, 30_000));
        assert_eq!(config.health_port, None);
        assert_eq!(config.transport.name(), "log");
    }

    #[test]
    fn test_sendgrid_is_default_and_requires_key() {
        let err = Config::from_source(source(&[("FROM_EMAIL", "noreply@clinic.test")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SENDGRID_API_KEY")));
    }

    #[test]
    fn test_sendgrid_requires_sender() {
        let err = Config::from_source(source(&[("SENDGRID_API_KEY", "SG.key")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("FROM_EMAIL")));
    }

    #[test]
    fn test_sendgrid_config() {
        let config = Config::from_source(source(&[
            ("SENDGRID_API_KEY", "SG.key"),
            ("FROM_EMAIL", "noreply@clinic.test"),
            ("BRAND_NAME", "Clinic"),
        ]))
        .unwrap();

        match config.transport {
            TransportConfig::SendGrid(sg) => {
                assert_eq!(sg.api_key, "SG.key");
                assert_eq!(sg.sender.email, "noreply@clinic.test");
                assert_eq!(sg.sender.name, "Clinic");
            }
            other => panic!("Expected SendGrid, got {}", other.name()),
        }
    }

    #[test]
    fn test_smtp_requires_credentials() {
        let err = Config::from_source(source(&[
            ("MAIL_TRANSPORT", "smtp"),
            ("SMTP_HOST", "smtp.test"),
            ("SMTP_USER", "user"),
            ("FROM_EMAIL", "noreply@clinic.test"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SMTP_PASS")));
    }

    #[test]
    fn test_smtp_config() {
        let config = Config::from_source(source(&[
            ("MAIL_TRANSPORT", "SMTP"),
            ("SMTP_HOST", "smtp.test"),
            ("SMTP_PORT", "2525"),
            ("SMTP_USER", "user"),
            ("SMTP_PASS", "secret"),
            ("SMTP_USE_TLS", "false"),
            ("FROM_EMAIL", "noreply@clinic.test"),
        ]))
        .unwrap();

        match config.transport {
            TransportConfig::Smtp(smtp) => {
                assert_eq!(smtp.port, 2525);
                assert!(!smtp.use_tls);
            }
            other => panic!("Expected Smtp, got {}", other.name()),
        }
    }

    #[test]
    fn test_invalid_smtp_port() {
        let err = Config::from_source(source(&[
            ("MAIL_TRANSPORT", "smtp"),
            ("SMTP_HOST", "smtp.test"),
            ("SMTP_PORT", "abc"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "SMTP_PORT", .. }));
    }

    #[test]
    fn test_unknown_transport() {
        let err = Config::from_source(source(&[("MAIL_TRANSPORT", "twilio")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "MAIL_TRANSPORT", .. }));
    }

    #[test]
    fn test_blank_credential_counts_as_missing() {
        let err = Config::from_source(source(&[
            ("SENDGRID_API_KEY", "   "),
            ("FROM_EMAIL", "noreply@clinic.test"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SENDGRID_API_KEY")));
    }

    #[test]
    fn test_parse_range_valid() {
        let get = source(&[("TEST_RANGE", "100,500")]);
        assert_eq!(parse_range(&get, "TEST_RANGE", (0, 0)), (100, 500));
    }

    #[test]
    fn test_parse_range_default() {
        let get = source(&[("TEST_RANGE", "500,100")]);
        assert_eq!(parse_range(&get, "TEST_RANGE", (10, 20)), (10, 20));
        assert_eq!(parse_range(&get, "NONEXISTENT_VAR", (10, 20)), (10, 20));
    }

    #[test]
    fn test_same_queue_for_both_kinds_rejected() {
        let err = Config::from_source(source(&[
            ("MAIL_TRANSPORT", "log"),
            ("REMINDER_QUEUE", "jobs"),
            ("SECURITY_QUEUE", "jobs"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "SECURITY_QUEUE", .. }));

        let err = Config::from_source(source(&[
            ("MAIL_TRANSPORT", "log"),
            ("REMINDER_QUEUE", "email_queue"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_health_port() {
        let config = Config::from_source(source(&[
            ("MAIL_TRANSPORT", "log"),
            ("HEALTH_PORT", " 8080 "),
        ]))
        .unwrap();
        assert_eq!(config.health_port, Some(8080));

        let get = source(&[("HEALTH_PORT", "http")]);
        assert_eq!(parse_opt::<_, u16>(&get, "HEALTH_PORT"), None);
        assert_eq!(parse_opt::<_, u16>(&get, "NONEXISTENT_VAR"), None);
    }

    #[test]
    fn test_bindings() {
        let config = Config::from_source(source(&[
            ("MAIL_TRANSPORT", "log"),
            ("MAX_DELIVERY_ATTEMPTS", "0"),
            ("REMINDER_QUEUE", "reminders"),
        ]))
        .unwrap();

        assert_eq!(config.max_delivery_attempts, 0);
        let bindings = config.bindings();
        assert_eq!(bindings[0], QueueBinding::new("reminders", JobKind::Reminder));
        assert_eq!(bindings[1].kind, JobKind::SecurityCode);
    }
}
