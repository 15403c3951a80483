//! SMTP dispatch channel

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

use crate::config::SmtpConfig;
use crate::notification::RenderedEmail;
use crate::{Error, Result};

/// Pluggable mail transport; SMTP in production, a recorder in tests
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, to: &str, email: &RenderedEmail) -> Result<()>;
}

/// Lettre-backed SMTP mailer
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| Error::notification(format!("smtp relay: {}", e)))?
                .port(config.port);

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        let from: Mailbox = format!("{} <{}>", config.from_name, config.from_address)
            .parse()
            .map_err(|e| Error::notification(format!("bad from address: {}", e)))?;

        info!(host = %config.host, port = config.port, "SMTP transport configured");
        Ok(Self { transport: builder.build(), from })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, to: &str, email: &RenderedEmail) -> Result<()> {
        let to: Mailbox = to
            .parse()
            .map_err(|e| Error::notification(format!("bad recipient address: {}", e)))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(email.text_body.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(email.html_body.clone()),
                    ),
            )
            .map_err(|e| Error::notification(format!("build message: {}", e)))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| Error::notification(format!("smtp send: {}", e)))?;

        debug!(subject = %email.subject, "email dispatched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailer_rejects_bad_from_address() {
        let config = SmtpConfig { from_address: "not an address".to_string(), ..Default::default() };
        assert!(SmtpMailer::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_send_rejects_bad_recipient() {
        let mailer = SmtpMailer::new(&SmtpConfig::default()).unwrap();
        let email = RenderedEmail {
            subject: "s".to_string(),
            text_body: "t".to_string(),
            html_body: "<p>t</p>".to_string(),
        };
        let err = mailer.send("<<broken>>", &email).await.unwrap_err();
        assert_eq!(err.category(), "notification");
    }
}
