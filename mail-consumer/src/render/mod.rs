//! Content rendering.
//!
//! Maps a decoded [`Job`] to a delivery-ready [`RenderedMessage`] using
//! handlebars templates registered once at startup. Rendering does no I/O;
//! user-supplied fields are HTML-escaped by the template engine.

pub mod templates;

use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use crate::error::RenderError;
use crate::queue::{
    Job, ReminderJob, SecurityCodeJob, SecurityCodeKind, PASSWORD_RESET_SUBJECT,
    VERIFICATION_SUBJECT,
};
use templates::accent_tint;

pub use templates::{ACCENT_AMBER, ACCENT_GREEN};

/// Fixed subject line for appointment reminders.
pub const REMINDER_SUBJECT: &str = "Appointment reminder";

/// Rendered message handed to the delivery transport. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Serialize)]
struct LayoutContext<'a> {
    brand: &'a str,
    title: &'a str,
    accent: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct ReminderContext<'a> {
    brand: &'a str,
    patient_name: &'a str,
    date: &'a str,
    time: &'a str,
    accent: &'a str,
    tint: &'a str,
}

#[derive(Serialize)]
struct CodeContext<'a> {
    code: &'a str,
    accent: &'a str,
    tint: &'a str,
}

/// Renders jobs into the shared branded layout.
#[derive(Debug, Clone)]
pub struct Renderer {
    brand: String,
    handlebars: Handlebars<'static>,
}

impl Renderer {
    /// Create a renderer with all templates registered.
    pub fn new(brand: &str) -> Result<Self, RenderError> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);

        for (name, source) in [
            (templates::LAYOUT, templates::LAYOUT_TEMPLATE),
            (templates::REMINDER, templates::REMINDER_TEMPLATE),
            (templates::VERIFICATION, templates::VERIFICATION_TEMPLATE),
            (templates::PASSWORD_RESET, templates::PASSWORD_RESET_TEMPLATE),
        ] {
            handlebars
                .register_template_string(name, source)
                .map_err(|e| RenderError::Register {
                    name,
                    source: Box::new(e),
                })?;
        }

        Ok(Self {
            brand: brand.to_string(),
            handlebars,
        })
    }

    /// Render a job.
    pub fn render(&self, job: &Job) -> Result<RenderedMessage, RenderError> {
        match job {
            Job::Reminder(reminder) => self.render_reminder(reminder),
            Job::SecurityCode(security) => self.render_security_code(security),
        }
    }

    fn render_reminder(&self, job: &ReminderJob) -> Result<RenderedMessage, RenderError> {
        debug!(appointment_id = job.appointment_id, "render_reminder");

        let body = self.template(
            templates::REMINDER,
            &ReminderContext {
                brand: &self.brand,
                patient_name: &job.patient_name,
                date: &job.date,
                time: &job.time,
                accent: ACCENT_GREEN,
                tint: accent_tint(ACCENT_GREEN),
            },
        )?;

        Ok(RenderedMessage {
            to: job.recipient.clone(),
            subject: REMINDER_SUBJECT.to_string(),
            html: self.layout(REMINDER_SUBJECT, ACCENT_GREEN, &body)?,
        })
    }

    fn render_security_code(&self, job: &SecurityCodeJob) -> Result<RenderedMessage, RenderError> {
        let kind = job.resolved_kind();
        debug!(recipient = %job.recipient, kind = ?kind, "render_security_code");

        let (template, subject, accent) = match kind {
            SecurityCodeKind::PasswordReset => {
                (templates::PASSWORD_RESET, PASSWORD_RESET_SUBJECT, ACCENT_AMBER)
            }
            // Producers cannot choose the subject of a verification message.
            SecurityCodeKind::VerificationCode => {
                (templates::VERIFICATION, VERIFICATION_SUBJECT, ACCENT_GREEN)
            }
        };

        let body = self.template(
            template,
            &CodeContext {
                code: &job.code,
                accent,
                tint: accent_tint(accent),
            },
        )?;

        Ok(RenderedMessage {
            to: job.recipient.clone(),
            subject: subject.to_string(),
            html: self.layout(subject, accent, &body)?,
        })
    }

    fn layout(&self, title: &str, accent: &str, body: &str) -> Result<String, RenderError> {
        self.template(
            templates::LAYOUT,
            &LayoutContext {
                brand: &self.brand,
                title,
                accent,
                body,
            },
        )
    }

    fn template<T: Serialize>(&self, name: &'static str, data: &T) -> Result<String, RenderError> {
        self.handlebars
            .render(name, data)
            .map_err(|e| RenderError::Render {
                name,
                source: Box::new(e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reminder() -> ReminderJob {
        ReminderJob {
            appointment_id: 42,
            recipient: "paciente@test.com".to_string(),
            patient_name: "Juan Pérez".to_string(),
            date: "2025-12-31".to_string(),
            time: "10:00 AM".to_string(),
        }
    }

    fn security(subject: &str) -> SecurityCodeJob {
        SecurityCodeJob {
            recipient: "user@test.com".to_string(),
            code: "123456".to_string(),
            subject: subject.to_string(),
            kind: None,
        }
    }

    #[test]
    fn test_render_reminder() {
        let renderer = Renderer::new("Identiclinic").unwrap();
        let message = renderer.render(&Job::Reminder(reminder())).unwrap();

        assert_eq!(message.to, "paciente@test.com");
        assert_eq!(message.subject, REMINDER_SUBJECT);
        assert!(message.html.contains("Hello <strong>Juan Pérez</strong>,"));
        assert!(message.html.contains("2025-12-31"));
        assert!(message.html.contains("10:00 AM"));
        assert!(message.html.contains(ACCENT_GREEN));
        assert!(message.html.contains("Identiclinic"));
    }

    #[test]
    fn test_render_password_reset_keeps_subject() {
        let renderer = Renderer::new("Identiclinic").unwrap();
        let message = renderer
            .render(&Job::SecurityCode(security(PASSWORD_RESET_SUBJECT)))
            .unwrap();

        assert_eq!(message.subject, "Restablecimiento de Contraseña Temporal");
        assert!(message.html.contains(ACCENT_AMBER));
        assert!(!message.html.contains(ACCENT_GREEN));
        assert!(message.html.contains("no action is needed"));
        assert!(message.html.contains("123456"));
    }

    #[test]
    fn test_render_verification_normalizes_subject() {
        let renderer = Renderer::new("Identiclinic").unwrap();

        for subject in [VERIFICATION_SUBJECT, "Click here to win", ""] {
            let message = renderer.render(&Job::SecurityCode(security(subject))).unwrap();
            assert_eq!(message.subject, VERIFICATION_SUBJECT);
            assert!(message.html.contains(ACCENT_GREEN));
            assert!(!message.html.contains(ACCENT_AMBER));
            assert!(message.html.contains("123456"));
        }
    }

    #[test]
    fn test_render_escapes_user_fields() {
        let renderer = Renderer::new("Identiclinic").unwrap();
        let mut job = reminder();
        job.patient_name = "<script>alert('x')</script>".to_string();
        job.time = "10 & 11".to_string();

        let message = renderer.render(&Job::Reminder(job)).unwrap();
        assert!(!message.html.contains("<script>"));
        assert!(message
            .html
            .contains("&lt;script&gt;alert(&#x27;x&#x27;)&lt;/script&gt;"));
        assert!(message.html.contains("10 &amp; 11"));
    }

    #[test]
    fn test_render_escapes_brand_and_code() {
        let renderer = Renderer::new("Smith & Sons <Clinic>").unwrap();
        let mut job = security(VERIFICATION_SUBJECT);
        job.code = "<b>1</b>".to_string();

        let message = renderer.render(&Job::SecurityCode(job)).unwrap();
        assert!(message.html.contains("Smith &amp; Sons &lt;Clinic&gt;"));
        assert!(message.html.contains("&lt;b&gt;1&lt;/b&gt;"));
        assert!(!message.html.contains("<b>1</b>"));
    }

    #[test]
    fn test_render_layout_wraps_body() {
        let renderer = Renderer::new("Identiclinic").unwrap();
        let message = renderer.render(&Job::Reminder(reminder())).unwrap();

        assert!(message.html.starts_with("<!DOCTYPE html>"));
        assert!(message.html.contains(r#"<html lang="en">"#));
        assert!(message.html.contains("<title>Appointment reminder</title>"));
        assert!(message.html.contains("Identiclinic<br>All rights reserved."));
        // The rendered body is inserted as markup, not escaped text.
        assert!(message.html.contains("<p>Hello <strong>"));
        assert!(!message.html.contains("&lt;p&gt;"));
    }
}
