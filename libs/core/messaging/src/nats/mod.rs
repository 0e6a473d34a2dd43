//! NATS JetStream backend.
//!
//! - [`NatsProducer`]: publish with durable ack, `Nats-Msg-Id` de-duplication,
//!   ack timeout and payload size check
//! - [`NatsWorker`]: durable pull consumer shared by all instances, explicit
//!   ack, semaphore-bounded concurrency, graceful stop between batches
//! - [`DlqManager`]: dead letter stream for failed jobs and poison payloads
//! - [`HealthServer`]: liveness/readiness/metrics routes
//!
//! # Example
//!
//! ```rust,ignore
//! let health = HealthState::new();
//! let worker = NatsWorker::new(
//!     jetstream.clone(),
//!     Arc::new(processor),
//!     WorkerConfig::from_stream::<InvoiceStream>(),
//!     health.clone(),
//! )
//! .await?;
//!
//! worker.run(shutdown_rx).await?;
//! ```

mod config;
mod consumer;
mod dlq;
mod error;
mod health;
mod metrics;
mod producer;
mod worker;

pub use config::{StreamConfig, WorkerConfig};
pub use consumer::{Delivery, NatsConsumer, NatsMessage, PoisonMessage};
pub use dlq::{DlqEntry, DlqKind, DlqManager};
pub use error::NatsError;
pub use health::{HealthServer, HealthState, HealthStatus};
pub use metrics::{init_metrics, NatsMetrics};
pub use producer::{NatsProducer, DEFAULT_MAX_PAYLOAD};
pub use worker::NatsWorker;
