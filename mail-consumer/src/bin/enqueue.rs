//! Mail Enqueue - publish reminder and security-code jobs for manual testing.
//!
//! Reads `AMQP_URL`, `REMINDER_QUEUE` and `SECURITY_QUEUE` the same way the
//! consumer does, so a job published here lands on the queue it serves.

use std::env;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mail_consumer::queue::{
    JobEnvelope, JobKind, Publisher, ReminderJob, SecurityCodeJob, SecurityCodeKind,
    DEFAULT_REMINDER_QUEUE, DEFAULT_SECURITY_QUEUE, PASSWORD_RESET_SUBJECT, VERIFICATION_SUBJECT,
};

#[derive(Parser)]
#[command(name = "mail-enqueue")]
#[command(version)]
#[command(about = "Publish test jobs to the mail consumer queues", long_about = None)]
struct Cli {
    /// Broker URL (defaults to $AMQP_URL)
    #[arg(long)]
    amqp_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue an appointment reminder
    Reminder {
        /// Recipient address
        #[arg(long)]
        to: String,
        #[arg(long, default_value_t = 1)]
        appointment_id: i64,
        #[arg(long)]
        patient_name: String,
        /// Appointment date, e.g. 2025-12-31
        #[arg(long)]
        date: String,
        /// Appointment time, e.g. "10:00 AM"
        #[arg(long)]
        time: String,
    },
    /// Enqueue an account verification code
    Verification {
        #[arg(long)]
        to: String,
        #[arg(long)]
        code: String,
    },
    /// Enqueue a temporary password-reset code
    Reset {
        #[arg(long)]
        to: String,
        #[arg(long)]
        code: String,
    },
}

impl Commands {
    /// Target queue, envelope and message id for the command.
    fn into_job(self) -> Result<(String, JobEnvelope, String)> {
        match self {
            Commands::Reminder {
                to,
                appointment_id,
                patient_name,
                date,
                time,
            } => {
                let job = ReminderJob {
                    appointment_id,
                    recipient: to,
                    patient_name,
                    date,
                    time,
                };
                let envelope = JobEnvelope::new(JobKind::Reminder, &job)?;
                Ok((
                    queue_name("REMINDER_QUEUE", DEFAULT_REMINDER_QUEUE),
                    envelope,
                    format!("appointment-{appointment_id}"),
                ))
            }
            Commands::Verification { to, code } => security_code(
                to,
                code,
                VERIFICATION_SUBJECT,
                SecurityCodeKind::VerificationCode,
            ),
            Commands::Reset { to, code } => security_code(
                to,
                code,
                PASSWORD_RESET_SUBJECT,
                SecurityCodeKind::PasswordReset,
            ),
        }
    }
}

fn security_code(
    to: String,
    code: String,
    subject: &str,
    kind: SecurityCodeKind,
) -> Result<(String, JobEnvelope, String)> {
    let message_id = format!("{}-{}", to, code);
    let job = SecurityCodeJob {
        recipient: to,
        code,
        subject: subject.to_string(),
        kind: Some(kind),
    };
    let envelope = JobEnvelope::new(JobKind::SecurityCode, &job)?;
    Ok((
        queue_name("SECURITY_QUEUE", DEFAULT_SECURITY_QUEUE),
        envelope,
        message_id,
    ))
}

fn queue_name(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    let cli = Cli::parse();
    let url = cli
        .amqp_url
        .or_else(|| env::var("AMQP_URL").ok())
        .unwrap_or_else(|| "amqp://localhost:5672/%2f".to_string());

    let (queue, envelope, message_id) = cli.command.into_job()?;

    let publisher = Publisher::new(url, vec![queue.clone()]);
    let result = publisher
        .publish(&queue, &envelope, &message_id)
        .await
        .context("Failed to enqueue job");
    publisher.close().await;
    result?;

    info!(queue = %queue, message_id = %message_id, "job_enqueued");
    Ok(())
}
