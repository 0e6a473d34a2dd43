//! Connectors and retry helpers for PostgreSQL and Redis.
//!
//! # Features
//!
//! - `postgres` (default) - PostgreSQL support with SeaORM and migrations
//! - `redis` (default) - Redis `ConnectionManager`
//! - `config` - `core_config::FromEnv` for [`postgres::PostgresConfig`]
//!
//! # Examples
//!
//! ```ignore
//! use database::postgres;
//! use migration::Migrator;
//!
//! let db = postgres::connect_from_config_with_retry(PostgresConfig::from_env()?, None).await?;
//! postgres::run_migrations::<Migrator>(&db, "email-service").await?;
//!
//! let cache = database::redis::connect_with_retry("redis://127.0.0.1:6379", None).await?;
//! ```

pub mod common;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "redis")]
pub mod redis;
