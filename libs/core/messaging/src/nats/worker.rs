//! NATS JetStream worker for processing jobs.

use crate::nats::config::WorkerConfig;
use crate::nats::consumer::{Delivery, NatsConsumer, NatsMessage, PoisonMessage};
use crate::nats::dlq::DlqManager;
use crate::nats::error::NatsError;
use crate::nats::health::HealthState;
use crate::nats::metrics::NatsMetrics;
use crate::{process_delivery, Disposition, Job, Processor, RedeliveryPolicy};
use async_nats::jetstream::Context;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// NATS JetStream worker for processing jobs.
///
/// Pulls batches from a durable consumer, processes up to
/// `max_concurrent_jobs` messages at once and settles each message according
/// to its [`Disposition`].
pub struct NatsWorker<J: Job, P: Processor<J>> {
    consumer: NatsConsumer,
    dlq: Arc<DlqManager>,
    processor: Arc<P>,
    config: WorkerConfig,
    metrics: Arc<NatsMetrics>,
    health: HealthState,
    semaphore: Arc<Semaphore>,
    _marker: std::marker::PhantomData<J>,
}

impl<J: Job, P: Processor<J> + 'static> NatsWorker<J, P> {
    /// Create a worker, ensuring the stream, consumer and DLQ stream exist.
    pub async fn new(
        jetstream: Context,
        processor: Arc<P>,
        config: WorkerConfig,
        health: HealthState,
    ) -> Result<Self, NatsError> {
        let consumer = NatsConsumer::init(&jetstream, config.clone()).await?;

        let dlq = Arc::new(DlqManager::new(Arc::new(jetstream), &config.dlq_stream));
        dlq.ensure_stream().await?;

        let metrics = Arc::new(NatsMetrics::new(&config.stream_name, processor.name()));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));

        Ok(Self {
            consumer,
            dlq,
            processor,
            config,
            metrics,
            health,
            semaphore,
            _marker: std::marker::PhantomData,
        })
    }

    /// Run the worker loop until `shutdown_rx` turns true.
    ///
    /// Shutdown only interrupts waiting for a batch. A batch already fetched
    /// is processed and settled before the loop exits.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), NatsError> {
        info!(
            stream = %self.config.stream_name,
            consumer = %self.config.consumer_name,
            max_concurrent = self.config.max_concurrent_jobs,
            max_deliver = self.config.redelivery.max_deliver,
            "Starting NATS worker"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let fetched = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                result = self.consumer.fetch::<J>(self.config.fetch_size()) => result,
            };

            match fetched {
                Ok(batch) => {
                    self.health.set_stream_connected(true, None).await;
                    if !batch.is_empty() {
                        self.process_batch(batch).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Error fetching batch");
                    self.health
                        .set_stream_connected(false, Some(e.to_string()))
                        .await;

                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!("Shutdown signal received, NATS worker stopped");
        Ok(())
    }

    async fn process_batch(&self, batch: Vec<Delivery<J>>) {
        let mut tasks = JoinSet::new();

        for delivery in batch {
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Worker semaphore closed");
                    break;
                }
            };

            match delivery {
                Delivery::Job(message) => {
                    self.metrics.job_received();

                    let span = info_span!(
                        "nats_message",
                        stream = %self.config.stream_name,
                        sequence = message.sequence,
                        delivery_count = message.delivery_count,
                        job_id = %message.job_id(),
                    );
                    let processor = self.processor.clone();
                    let dlq = self.dlq.clone();
                    let metrics = self.metrics.clone();
                    let policy = self.config.redelivery.clone();
                    let heartbeat = self.config.heartbeat_interval();

                    tasks.spawn(
                        async move {
                            handle_message(
                                message,
                                processor.as_ref(),
                                &dlq,
                                &metrics,
                                &policy,
                                heartbeat,
                            )
                            .await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Delivery::Poison(message) => {
                    let dlq = self.dlq.clone();
                    let metrics = self.metrics.clone();

                    tasks.spawn(async move {
                        handle_poison(message, &dlq, &metrics).await;
                        drop(permit);
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Message task panicked");
            }
        }
    }
}

async fn handle_message<J, P>(
    message: NatsMessage<J>,
    processor: &P,
    dlq: &DlqManager,
    metrics: &NatsMetrics,
    policy: &RedeliveryPolicy,
    heartbeat: Duration,
) where
    J: Job,
    P: Processor<J>,
{
    if message.is_redelivery() {
        debug!("Processing redelivered message");
    }

    let start = Instant::now();
    let progress = &message;
    let disposition = with_heartbeat(
        process_delivery(processor, &message.job, message.delivery_count, policy),
        heartbeat,
        move || async move {
            if let Err(e) = progress.in_progress().await {
                warn!(error = %e, "Failed to extend ack deadline");
            }
        },
    )
    .await;
    let label = disposition.label();

    let settled = match disposition {
        Disposition::Ack => {
            metrics.job_processed(start.elapsed());
            message.ack().await
        }
        Disposition::Redeliver { delay, error } => {
            warn!(
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Processing failed, message will be redelivered"
            );
            metrics.job_retried();
            message.nak_with_delay(delay).await
        }
        Disposition::DeadLetter { reason } => {
            match dlq
                .move_to_dlq(&message.job, &reason, message.sequence, message.delivery_count)
                .await
            {
                Ok(_) => {
                    metrics.job_moved_to_dlq();
                    processor.on_dead_letter(&message.job, &reason).await;
                    message.term().await
                }
                Err(e) => {
                    // Nothing is recorded yet, so the job is not given up on.
                    let delay = policy.redelivery_delay(message.delivery_count);
                    error!(
                        error = %e,
                        reason = %reason,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to write DLQ entry, message will be redelivered"
                    );
                    metrics.settle_failed("dlq");
                    message.nak_with_delay(delay).await
                }
            }
        }
    };

    if let Err(e) = settled {
        // Unsettled messages come back after ack_wait; processors are idempotent.
        warn!(error = %e, action = label, "Failed to settle message");
        metrics.settle_failed(label);
    }
}

/// Drive `work` to completion, calling `beat` every `period` while it runs.
async fn with_heartbeat<W, B, F>(work: W, period: Duration, mut beat: B) -> W::Output
where
    W: Future,
    B: FnMut() -> F,
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    tokio::pin!(work);
    loop {
        tokio::select! {
            biased;
            output = &mut work => return output,
            _ = ticker.tick() => beat().await,
        }
    }
}

async fn handle_poison(message: PoisonMessage, dlq: &DlqManager, metrics: &NatsMetrics) {
    metrics.poison_message();
    warn!(
        sequence = message.sequence,
        subject = %message.subject(),
        error = %message.error,
        "Undecodable message, recording and acking"
    );

    if let Err(e) = dlq
        .record_poison(
            message.payload(),
            &message.error,
            message.sequence,
            message.delivery_count,
        )
        .await
    {
        error!(
            error = %e,
            sequence = message.sequence,
            payload = %String::from_utf8_lossy(message.payload()),
            "Failed to record poison message"
        );
        metrics.settle_failed("dlq");
    }

    if let Err(e) = message.ack().await {
        warn!(error = %e, "Failed to ack poison message");
        metrics.settle_failed("ack");
    }
}
