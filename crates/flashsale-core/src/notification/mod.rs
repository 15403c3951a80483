//! Notification workers: render email events and dispatch them over SMTP

pub mod email;
pub mod payload;
pub mod templates;
pub mod worker;

pub use email::{MailTransport, SmtpMailer};
pub use payload::{EmailPayload, PayloadError};
pub use templates::{RenderedEmail, TemplateRegistry};
pub use worker::NotificationWorker;
