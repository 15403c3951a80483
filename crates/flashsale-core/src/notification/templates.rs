//! Email template rendering
//!
//! Every email ships a plain-text body and an HTML variant rendered from
//! the same context. Templates are compiled once at registry construction.

use handlebars::Handlebars;

use crate::notification::EmailPayload;
use crate::{Error, Result};

/// A rendered, ready-to-send email
#[derive(Debug, Clone)]
pub struct RenderedEmail {
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

/// Compiled template set for all email event types
pub struct TemplateRegistry {
    registry: Handlebars<'static>,
}

const TEMPLATES: [(&str, &str, &str); 4] = [
    (
        "verification",
        "Hi {{user_name}},\n\n\
         Please verify your email address.\n\n\
         {{#if verification_url}}Verification link: {{verification_url}}\n{{/if}}\
         Verification code: {{verification_token}}\n\n\
         This code expires at {{expires_at}}.\n",
        "<p>Hi {{user_name}},</p>\
         <p>Please verify your email address.</p>\
         {{#if verification_url}}<p><a href=\"{{verification_url}}\">Verify your email</a></p>{{/if}}\
         <p>Verification code: <strong>{{verification_token}}</strong></p>\
         <p>This code expires at {{expires_at}}.</p>",
    ),
    (
        "password_reset",
        "Hi {{user_name}},\n\n\
         We received a request to reset your password.\n\n\
         {{#if reset_url}}Reset link: {{reset_url}}\n{{/if}}\
         Reset code: {{reset_token}}\n\n\
         This code expires at {{expires_at}}. If you did not ask for a reset, ignore this email.\n",
        "<p>Hi {{user_name}},</p>\
         <p>We received a request to reset your password.</p>\
         {{#if reset_url}}<p><a href=\"{{reset_url}}\">Reset your password</a></p>{{/if}}\
         <p>Reset code: <strong>{{reset_token}}</strong></p>\
         <p>This code expires at {{expires_at}}. If you did not ask for a reset, ignore this email.</p>",
    ),
    (
        "password_changed",
        "Hi {{user_name}},\n\n\
         Your password was changed at {{changed_at}}.\n\n\
         If this was not you, contact support immediately.\n",
        "<p>Hi {{user_name}},</p>\
         <p>Your password was changed at {{changed_at}}.</p>\
         <p>If this was not you, contact support immediately.</p>",
    ),
    (
        "account_approval",
        "Hi {{user_name}},\n\n\
         Your account was approved at {{approved_at}}. Welcome!\n\n\
         {{#if login_url}}Log in here: {{login_url}}\n{{/if}}",
        "<p>Hi {{user_name}},</p>\
         <p>Your account was approved at {{approved_at}}. Welcome!</p>\
         {{#if login_url}}<p><a href=\"{{login_url}}\">Log in</a></p>{{/if}}",
    ),
];

impl TemplateRegistry {
    pub fn new() -> Result<Self> {
        let mut registry = Handlebars::new();

        for (name, text, html) in TEMPLATES {
            registry
                .register_template_string(&format!("{}_text", name), text)
                .map_err(|e| Error::notification(format!("bad template {}: {}", name, e)))?;
            registry
                .register_template_string(&format!("{}_html", name), html)
                .map_err(|e| Error::notification(format!("bad template {}: {}", name, e)))?;
        }

        Ok(Self { registry })
    }

    pub fn render(&self, payload: &EmailPayload) -> Result<RenderedEmail> {
        let context = payload.context();
        let name = payload.template();

        let text_body = self
            .registry
            .render(&format!("{}_text", name), &context)
            .map_err(|e| Error::notification(format!("render {}: {}", name, e)))?;
        let html_body = self
            .registry
            .render(&format!("{}_html", name), &context)
            .map_err(|e| Error::notification(format!("render {}: {}", name, e)))?;

        Ok(RenderedEmail { subject: payload.subject().to_string(), text_body, html_body })
    }
}
