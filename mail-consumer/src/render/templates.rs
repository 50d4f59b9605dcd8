//! Handlebars sources for the three notification templates.
//!
//! Bodies are rendered first and dropped into the layout's `{{{body}}}`
//! slot unescaped; every other `{{field}}` is HTML-escaped by handlebars.

/// Header band colour for reminders and verification codes.
pub const ACCENT_GREEN: &str = "#4CAF50";

/// Header band colour for password resets.
pub const ACCENT_AMBER: &str = "#FF9800";

/// Tinted background used for the highlighted detail box.
pub(crate) fn accent_tint(accent: &str) -> &'static str {
    if accent == ACCENT_AMBER {
        "#fff7e6"
    } else {
        "#f0f9f0"
    }
}

pub(crate) const LAYOUT: &str = "layout";
pub(crate) const REMINDER: &str = "reminder";
pub(crate) const VERIFICATION: &str = "verification";
pub(crate) const PASSWORD_RESET: &str = "password_reset";

/// Shared layout: accent header band, body slot, fixed footer.
pub(crate) const LAYOUT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8" />
<title>{{title}}</title>
<style>
@media only screen and (max-width: 600px) {
  .container { width: 100% !important; padding: 20px !important; }
  .card { padding: 20px !important; }
}
</style>
</head>
<body style="margin:0; padding:0; background:#f5f5f5; font-family:Arial, sans-serif;">
<table width="100%" cellpadding="0" cellspacing="0" style="background:#f5f5f5; padding:30px 0;">
<tr><td align="center">
<table class="container" width="600" cellpadding="0" cellspacing="0" style="background:white; border-radius:10px; overflow:hidden;">
<tr><td style="background:{{accent}}; padding:25px; text-align:center; color:white;">
<h1 style="margin:0; font-size:24px;">{{brand}}</h1>
</td></tr>
<tr><td class="card" style="padding:30px; font-size:16px; color:#333;">
{{{body}}}
</td></tr>
<tr><td style="background:#eeeeee; padding:15px; text-align:center; font-size:12px; color:#555;">
{{brand}}<br>All rights reserved.
</td></tr>
</table>
</td></tr>
</table>
</body>
</html>"#;

pub(crate) const REMINDER_TEMPLATE: &str = r#"<p>Hello <strong>{{patient_name}}</strong>,</p>
<p>This is a reminder that you have an upcoming appointment with us.</p>
<div style="background:{{tint}}; padding:20px; border-radius:8px; margin:20px 0; border-left:5px solid {{accent}};">
<p style="margin:0;"><strong>Date:</strong> {{date}}</p>
<p style="margin:5px 0 0;"><strong>Time:</strong> {{time}}</p>
</div>
<p>If you need to reschedule or cancel, please get in touch with us.</p>
<p style="margin-top:30px;">Thank you for trusting <strong>{{brand}}</strong>.</p>"#;

pub(crate) const VERIFICATION_TEMPLATE: &str = r#"<p>Use the following code to verify your account:</p>
<div style="background:{{tint}}; padding:20px; border-radius:8px; margin:20px 0; border-left:5px solid {{accent}}; text-align:center;">
<p style="margin:0; font-size:28px; letter-spacing:6px;"><strong>{{code}}</strong></p>
</div>
<p>The code is valid for a limited time. Do not share it with anyone.</p>"#;

pub(crate) const PASSWORD_RESET_TEMPLATE: &str = r#"<p>We received a request to reset your password. Your temporary code is:</p>
<div style="background:{{tint}}; padding:20px; border-radius:8px; margin:20px 0; border-left:5px solid {{accent}}; text-align:center;">
<p style="margin:0; font-size:28px; letter-spacing:6px;"><strong>{{code}}</strong></p>
</div>
<p>Use it to sign in and choose a new password as soon as possible.</p>
<p>If you did not request a password reset, you can ignore this message; no action is needed.</p>"#;
