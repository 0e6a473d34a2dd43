//! Retry and redelivery configuration.

use std::time::Duration;

/// Redelivery policy applied to transient processing failures.
#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    /// Deliveries (including the first) before a message is dead-lettered
    pub max_deliver: u32,

    /// Delay requested from the broker before the next delivery
    pub backoff: BackoffStrategy,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_deliver: 5,
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
        }
    }
}

impl RedeliveryPolicy {
    pub fn new(max_deliver: u32) -> Self {
        Self {
            max_deliver,
            ..Default::default()
        }
    }

    /// Set the backoff strategy.
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether a message seen `delivery_count` times has used up its deliveries.
    pub fn is_exhausted(&self, delivery_count: u32) -> bool {
        delivery_count >= self.max_deliver
    }

    /// Delay before the delivery following `delivery_count`.
    pub fn redelivery_delay(&self, delivery_count: u32) -> Duration {
        self.backoff.delay(delivery_count.saturating_sub(1))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),

    /// Exponential backoff (base * 2^retry_count, capped at max)
    Exponential { base: Duration, max: Duration },

    /// Linear backoff (base * (retry_count + 1), capped at max)
    Linear { base: Duration, max: Duration },
}

impl BackoffStrategy {
    /// Calculate the delay for a given retry count.
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(d) => *d,
            BackoffStrategy::Exponential { base, max } => {
                let delay = base.saturating_mul(2u32.saturating_pow(retry_count));
                delay.min(*max)
            }
            BackoffStrategy::Linear { base, max } => {
                let delay = base.saturating_mul(retry_count.saturating_add(1));
                delay.min(*max)
            }
        }
    }
}
