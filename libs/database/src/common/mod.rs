//! Utilities shared across database implementations

pub mod retry;

pub use retry::{RetryConfig, retry_with_backoff, retry_with_backoff_if};
