//! Emails Domain
//!
//! Persists email records, publishes a creation event per record and drives
//! delivery from a durable JetStream consumer.
//!
//! # Architecture
//!
//! ```text
//!   HTTP handlers ──► EmailService ──► EmailStore   (Postgres / in-memory)
//!                          │      ├──► EmailCache   (Redis / in-memory / none)
//!                          │      └──► EventPublisher ──► EMAIL_EVENTS stream
//!                          │                                   │
//!                          └── SendPipeline ◄── CreationEventProcessor (NatsWorker)
//!                                   │
//!                                   ▼
//!                             MailTransport
//! ```
//!
//! Record status only moves forward: `pending → published → sent | failed`.
//! Every status change goes through [`EmailStore::update_status`], which is
//! conditional on the current status, so concurrent redeliveries cannot
//! regress a record.
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_emails::{EmailService, InMemoryEmailStore, NoopEmailCache, SendPipeline};
//!
//! let service = EmailService::new(store, cache, publisher, pipeline);
//! let record = service.create(input).await?;
//! service.publish_create(record.id).await?;
//! ```

pub mod cache;
pub mod error;
pub mod handlers;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod postgres;
pub mod processor;
pub mod publisher;
pub mod service;
pub mod store;
pub mod streams;
pub mod sweeper;

pub use cache::{
    CacheLookup, CacheVersion, EmailCache, InMemoryEmailCache, NoopEmailCache, RedisEmailCache,
};
pub use error::{EmailError, EmailResult};
pub use memory::InMemoryEmailStore;
pub use models::{
    CreateEmail, CreationEvent, EmailPage, EmailRecord, EmailStatus, PageCursor, SearchQuery,
};
pub use pipeline::{SendPipeline, SendPolicy};
pub use postgres::PgEmailStore;
pub use processor::CreationEventProcessor;
pub use publisher::{EventPublisher, NatsEventPublisher};
pub use service::EmailService;
pub use store::EmailStore;
pub use streams::EmailEventsStream;
pub use sweeper::{PublishedSweeper, SweepConfig};
