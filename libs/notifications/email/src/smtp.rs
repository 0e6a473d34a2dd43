//! SMTP transport using lettre

use crate::error::TransportError;
use crate::transport::{DeliveryReceipt, MailTransport, OutgoingMail};
use async_trait::async_trait;
use core_config::{env_optional, env_or_default, env_parse, ConfigError, FromEnv};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;

/// SMTP relay configuration
#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    /// Connection/command timeout inside lettre.
    pub timeout: Duration,
}

impl Default for SmtpConfig {
    /// Mailpit/Mailhog on localhost:1025, no auth.
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1025,
            username: None,
            password: None,
            use_tls: false,
            timeout: Duration::from_secs(30),
        }
    }
}

impl FromEnv for SmtpConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or_default("SMTP_HOST", "localhost"),
            port: env_parse("SMTP_PORT", 1025)?,
            username: env_optional("SMTP_USERNAME"),
            password: env_optional("SMTP_PASSWORD"),
            use_tls: env_parse("SMTP_USE_TLS", false)?,
            timeout: Duration::from_secs(env_parse("SMTP_TIMEOUT_SECS", 30)?),
        })
    }
}

/// [`MailTransport`] backed by an SMTP relay.
pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    pub fn new(config: SmtpConfig) -> Result<Self, TransportError> {
        let credentials = config
            .username
            .clone()
            .map(|user| Credentials::new(user, config.password.clone().unwrap_or_default()));

        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| TransportError::Unavailable(format!("SMTP relay setup: {e}")))?
        } else {
            // No TLS (Mailpit/Mailhog, in-cluster relays)
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        if let Some(credentials) = credentials {
            builder = builder.credentials(credentials);
        }

        let transport = builder
            .port(config.port)
            .timeout(Some(config.timeout))
            .build();

        tracing::debug!(
            host = %config.host,
            port = config.port,
            tls = config.use_tls,
            "SMTP transport configured"
        );

        Ok(Self { transport })
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, TransportError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

pub(crate) fn build_message(mail: &OutgoingMail) -> Result<Message, TransportError> {
    if mail.to.is_empty() {
        return Err(TransportError::Build("no recipients".to_string()));
    }

    let from = parse_mailbox(&mail.from)?;
    let message_id = mail
        .reference
        .as_ref()
        .map(|reference| format!("<{}@{}>", reference, from.email.domain()));

    let mut builder = Message::builder()
        .from(from)
        .subject(&mail.subject)
        .message_id(message_id);

    for recipient in &mail.to {
        builder = builder.to(parse_mailbox(recipient)?);
    }

    builder
        .header(ContentType::TEXT_PLAIN)
        .body(mail.body.clone())
        .map_err(|e| TransportError::Build(e.to_string()))
}

fn classify(error: lettre::transport::smtp::Error) -> TransportError {
    if error.is_permanent() {
        TransportError::Rejected(error.to_string())
    } else if error.is_transient() {
        TransportError::Deferred(error.to_string())
    } else if error.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Unavailable(error.to_string())
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<DeliveryReceipt, TransportError> {
        let message = build_message(mail)?;

        let response = self.transport.send(message).await.map_err(classify)?;

        let message_id = response
            .message()
            .next()
            .map(|s| s.to_string())
            .or_else(|| mail.reference.clone())
            .unwrap_or_default();

        tracing::debug!(
            recipients = mail.to.len(),
            code = %response.code(),
            "Relay accepted message"
        );

        Ok(DeliveryReceipt { message_id })
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransportError::Unavailable(
                "SMTP relay did not answer NOOP".to_string(),
            )),
            Err(e) => Err(classify(e)),
        }
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}
