//! Queue message types for the two-queue architecture.
//!
//! This module defines the message formats for:
//! - the reminder queue: appointment reminders emitted by the scheduler
//! - the security queue: verification and password-reset codes
//!
//! Both queues carry the same outer envelope, `{ pattern, data }`, as emitted
//! by the producer's client proxy.

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::JobError;

/// Default queue name for appointment reminders.
pub const DEFAULT_REMINDER_QUEUE: &str = "scheduler_jobs_queue";

/// Default queue name for account security codes.
pub const DEFAULT_SECURITY_QUEUE: &str = "email_queue";

/// Suffix appended to a queue name to form its dead-letter companion.
pub const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// Pattern the producer uses for appointment reminders.
pub const REMINDER_PATTERN: &str = "send_recordatorio";

/// Pattern used for security-code jobs.
pub const SECURITY_CODE_PATTERN: &str = "send_security_code";

/// Subject literal that selects the password-reset template.
pub const PASSWORD_RESET_SUBJECT: &str = "Restablecimiento de Contraseña Temporal";

/// Subject literal for account verification; also the normalized outgoing subject.
pub const VERIFICATION_SUBJECT: &str = "Código de Verificación de Cuenta";

/// Name of the dead-letter queue paired with `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

// =============================================================================
// Routing
// =============================================================================

/// Kind of job a queue carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Reminder,
    SecurityCode,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Reminder => "reminder",
            JobKind::SecurityCode => "security_code",
        }
    }

    /// Envelope pattern expected for this kind.
    pub fn pattern(&self) -> &'static str {
        match self {
            JobKind::Reminder => REMINDER_PATTERN,
            JobKind::SecurityCode => SECURITY_CODE_PATTERN,
        }
    }
}

/// Binds a queue name to the job kind decoded from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub kind: JobKind,
}

impl QueueBinding {
    pub fn new(queue: impl Into<String>, kind: JobKind) -> Self {
        Self {
            queue: queue.into(),
            kind,
        }
    }

    pub fn dead_letter_queue(&self) -> String {
        dead_letter_queue(&self.queue)
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// Wire-level wrapper around every job.
///
/// `pattern` is carried for diagnostics only; the queue a message arrives on
/// decides how `data` is decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    #[serde(default)]
    pub pattern: String,
    pub data: serde_json::Value,
}

impl JobEnvelope {
    /// Wrap a payload under the pattern of `kind`.
    pub fn new<T: Serialize>(kind: JobKind, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            pattern: kind.pattern().to_string(),
            data: serde_json::to_value(payload)?,
        })
    }

    /// Decode a raw message body.
    pub fn decode(body: &[u8]) -> Result<Self, JobError> {
        serde_json::from_slice(body).map_err(JobError::envelope)
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// One scheduled appointment notification.
///
/// Field aliases accept the producer's original Spanish field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderJob {
    #[serde(alias = "citaId")]
    pub appointment_id: i64,
    #[serde(alias = "destinatario")]
    pub recipient: String,
    #[serde(alias = "nombrePaciente")]
    pub patient_name: String,
    #[serde(alias = "fecha")]
    pub date: String,
    #[serde(alias = "hora")]
    pub time: String,
}

/// Which security template a code is rendered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityCodeKind {
    VerificationCode,
    PasswordReset,
}

/// Account verification or password-reset one-time code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityCodeJob {
    #[serde(alias = "correo")]
    pub recipient: String,
    #[serde(alias = "codigo")]
    pub code: String,
    #[serde(alias = "asunto")]
    pub subject: String,
    /// Explicit template choice. Older producers omit it and rely on `subject`.
    /// An unrecognized value is ignored so the subject decides instead.
    #[serde(
        default,
        deserialize_with = "known_kind",
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<SecurityCodeKind>,
}

fn known_kind<'de, D>(deserializer: D) -> Result<Option<SecurityCodeKind>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;

    Ok(raw.and_then(|value| {
        match serde_json::from_value::<SecurityCodeKind>(value.clone()) {
            Ok(kind) => Some(kind),
            Err(_) => {
                warn!(kind = %value, "security_code_kind_unrecognized");
                None
            }
        }
    }))
}

impl SecurityCodeJob {
    /// Resolve the template kind.
    ///
    /// An explicit `kind` wins. Otherwise only an exact match on the reset
    /// subject selects the reset template; everything else is verification.
    pub fn resolved_kind(&self) -> SecurityCodeKind {
        match self.kind {
            Some(kind) => kind,
            None if self.subject == PASSWORD_RESET_SUBJECT => SecurityCodeKind::PasswordReset,
            None => SecurityCodeKind::VerificationCode,
        }
    }
}

/// A decoded job, ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Reminder(ReminderJob),
    SecurityCode(SecurityCodeJob),
}

impl Job {
    /// Decode an envelope's `data` as the payload type of `kind`.
    pub fn decode(kind: JobKind, data: serde_json::Value) -> Result<Self, JobError> {
        match kind {
            JobKind::Reminder => serde_json::from_value(data)
                .map(Job::Reminder)
                .map_err(JobError::payload),
            JobKind::SecurityCode => serde_json::from_value(data)
                .map(Job::SecurityCode)
                .map_err(JobError::payload),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::Reminder(_) => JobKind::Reminder,
            Job::SecurityCode(_) => JobKind::SecurityCode,
        }
    }

    /// Identifier used in logs: the appointment id or the recipient.
    pub fn job_id(&self) -> String {
        match self {
            Job::Reminder(job) => format!("appointment-{}", job.appointment_id),
            Job::SecurityCode(job) => job.recipient.clone(),
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            Job::Reminder(job) => &job.recipient,
            Job::SecurityCode(job) => &job.recipient,
        }
    }
}
