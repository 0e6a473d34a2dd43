use thiserror::Error;

/// Failure reported by a [`MailTransport`](crate::MailTransport).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// An address could not be parsed into a mailbox.
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The message itself could not be assembled.
    #[error("Failed to build message: {0}")]
    Build(String),

    /// The relay refused the message for good (5xx).
    #[error("Rejected by relay: {0}")]
    Rejected(String),

    /// The relay asked us to try later (4xx).
    #[error("Deferred by relay: {0}")]
    Deferred(String),

    /// Connection, TLS or I/O failure before the relay answered.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Transport timed out")]
    Timeout,
}

impl TransportError {
    /// Whether sending the same message again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Deferred(_) | TransportError::Unavailable(_) | TransportError::Timeout
        )
    }
}
