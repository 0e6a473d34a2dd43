//! Job processing abstractions for at-least-once message consumers.
//!
//! This library separates *what* a consumer does with a message from *how*
//! the broker is told about it:
//! - [`Job`]: a serializable unit of work with a stable idempotency key
//! - [`Processor`]: domain logic that handles one job and classifies failures
//! - [`process_delivery`]: turns a processor outcome plus the broker's delivery
//!   count into a [`Disposition`] (ack, redeliver later, or dead-letter)
//! - [`nats`] (feature `nats`): JetStream producer, pull consumer, DLQ and worker
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐     ┌─────────────────────┐     ┌────────────────┐
//! │  NatsProducer  │────▶│   NATS JetStream    │────▶│   NatsWorker   │
//! │ (durable ack)  │     │  (durable stream)   │     │ (pull, manual  │
//! └────────────────┘     └─────────────────────┘     │      ack)      │
//!                                  │                 └───────┬────────┘
//!                                  ▼                         │ process_delivery
//!                        ┌─────────────────┐        ┌────────▼───────┐
//!                        │   DLQ stream    │◀───────│   Processor    │
//!                        │ (failed/poison) │        │ (domain logic) │
//!                        └─────────────────┘        └────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use messaging::{Job, Processor, ProcessingError};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct WelcomeJob {
//!     user_id: Uuid,
//! }
//!
//! impl Job for WelcomeJob {
//!     fn job_id(&self) -> String { self.user_id.to_string() }
//! }
//!
//! struct WelcomeProcessor { ... }
//!
//! #[async_trait]
//! impl Processor<WelcomeJob> for WelcomeProcessor {
//!     async fn process(&self, job: &WelcomeJob) -> Result<(), ProcessingError> { ... }
//!     fn name(&self) -> &'static str { "welcome_processor" }
//! }
//! ```

mod config;
mod disposition;
mod error;
mod job;
mod processor;

#[cfg(feature = "nats")]
pub mod nats;

pub use config::{BackoffStrategy, RedeliveryPolicy};
pub use disposition::{process_delivery, Disposition};
pub use error::{ErrorCategory, ProcessingError};
pub use job::Job;
pub use processor::Processor;
