//! Outbound mail transport.
//!
//! The send pipeline only depends on [`MailTransport`]. Two implementations
//! ship with the crate:
//!
//! - `smtp` (default feature) - [`SmtpTransport`] over lettre, works against
//!   real relays as well as Mailpit/Mailhog in development
//! - [`RecordingTransport`] - scripted outcomes for tests and local runs
//!
//! Failures come back as [`TransportError`], already split into retryable and
//! permanent so callers never have to inspect SMTP reply codes.
//!
//! ```ignore
//! use email::{MailTransport, OutgoingMail, SmtpConfig, SmtpTransport};
//! use core_config::FromEnv;
//!
//! let transport = SmtpTransport::new(SmtpConfig::from_env()?)?;
//! let receipt = transport
//!     .send(&OutgoingMail::new("ops@example.com", vec!["a@example.com".into()], "Hi", "body"))
//!     .await?;
//! ```

pub mod error;
pub mod recording;
#[cfg(feature = "smtp")]
pub mod smtp;
pub mod transport;

pub use error::TransportError;
pub use recording::{RecordingTransport, ScriptedOutcome};
pub use transport::{DeliveryReceipt, MailTransport, OutgoingMail};

#[cfg(feature = "smtp")]
pub use smtp::{SmtpConfig, SmtpTransport};
