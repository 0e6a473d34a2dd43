//! Reconciliation of records stuck in `Published`.
//!
//! A record stays `Published` when its event was lost between the broker ack
//! and the consumer (stream purge, consumer reset) or when the consumer never
//! finished it. The sweeper republishes such events; the consumer skips
//! records that already finished, so a republish never sends twice.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::EmailCache;
use crate::error::EmailResult;
use crate::metrics;
use crate::models::{CreationEvent, EmailStatus, now_micros};
use crate::publisher::EventPublisher;
use crate::store::EmailStore;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    /// Minimum time since the last status change before a record is swept
    pub stale_after: Duration,
    /// Records claimed per sweep
    pub batch: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(900),
            batch: 100,
        }
    }
}

pub struct PublishedSweeper<S, C, P>
where
    S: EmailStore,
    C: EmailCache,
    P: EventPublisher,
{
    store: Arc<S>,
    cache: Arc<C>,
    publisher: Arc<P>,
    config: SweepConfig,
}

impl<S, C, P> PublishedSweeper<S, C, P>
where
    S: EmailStore,
    C: EmailCache,
    P: EventPublisher,
{
    pub fn new(store: Arc<S>, cache: Arc<C>, publisher: Arc<P>, config: SweepConfig) -> Self {
        Self {
            store,
            cache,
            publisher,
            config,
        }
    }

    /// Claim one batch of stale records and republish their events.
    ///
    /// Returns how many events were republished.
    pub async fn sweep_once(&self) -> EmailResult<usize> {
        let cutoff =
            now_micros() - chrono::Duration::milliseconds(self.config.stale_after.as_millis() as i64);
        let stale = self
            .store
            .claim_stale(EmailStatus::Published, cutoff, self.config.batch)
            .await?;

        let mut republished = 0;
        for record in &stale {
            self.cache.invalidate(record.id).await;

            match self.publisher.publish(&CreationEvent::from(record)).await {
                Ok(sequence) => {
                    republished += 1;
                    metrics::stale_republished();
                    warn!(
                        email_id = %record.id,
                        sequence,
                        created_at = %record.created_at,
                        "Republished stale email event"
                    );
                }
                // Picked up again by a later sweep once its claim ages out.
                Err(e) => warn!(email_id = %record.id, error = %e, "Failed to republish stale email"),
            }
        }

        if !stale.is_empty() {
            info!(claimed = stale.len(), republished, "Sweep finished");
        }
        Ok(republished)
    }

    /// Sweep every `interval` until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "Starting published-email sweeper"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Sweep failed");
                    }
                }
            }
        }

        debug!("Sweeper stopped");
    }
}
