//! Service configuration, loaded once from the environment at startup.

use core_config::server::ServerConfig;
use core_config::{env_optional, env_or_default, env_parse, ConfigError, FromEnv};
use database::postgres::PostgresConfig;
use domain_emails::{SendPolicy, SweepConfig};
use email::SmtpConfig;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct EmailServiceConfig {
    pub server: ServerConfig,
    pub postgres: PostgresConfig,
    pub run_migrations: bool,

    /// Unset disables the read cache
    pub redis_url: Option<String>,
    pub cache_ttl: Duration,

    pub nats_url: String,
    pub publish_timeout: Duration,

    pub worker_concurrency: usize,
    pub worker_batch_size: usize,

    pub send: SendPolicy,
    pub smtp: SmtpConfig,
    pub sweep: SweepConfig,

    /// How long in-flight work may drain before outstanding sends are cancelled
    pub shutdown_grace: Duration,
    pub request_timeout: Duration,
}

impl EmailServiceConfig {
    /// Whether one send, retries included, can outlast the consumer's ack wait.
    pub fn send_outlasts(&self, ack_wait: Duration) -> bool {
        self.send.worst_case() >= ack_wait
    }
}

impl FromEnv for EmailServiceConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let send = SendPolicy::new(
            env_parse("EMAIL_SEND_MAX_ATTEMPTS", 3u32)?,
            Duration::from_millis(env_parse("EMAIL_SEND_ATTEMPT_TIMEOUT_MS", 10_000u64)?),
            Duration::from_millis(env_parse("EMAIL_SEND_BACKOFF_BASE_MS", 200u64)?),
        );

        let sweep = SweepConfig {
            interval: Duration::from_secs(env_parse("EMAIL_SWEEP_INTERVAL_SECS", 60u64)?.max(1)),
            stale_after: Duration::from_secs(env_parse("EMAIL_SWEEP_STALE_AFTER_SECS", 900u64)?),
            batch: env_parse("EMAIL_SWEEP_BATCH", 100u32)?,
        };

        Ok(Self {
            server: ServerConfig::from_env()?,
            postgres: PostgresConfig::from_env()?,
            run_migrations: env_parse("RUN_MIGRATIONS", true)?,
            redis_url: env_optional("REDIS_URL"),
            cache_ttl: Duration::from_secs(env_parse("EMAIL_CACHE_TTL_SECS", 300u64)?),
            nats_url: env_or_default("NATS_URL", "nats://localhost:4222"),
            publish_timeout: Duration::from_millis(env_parse("NATS_PUBLISH_TIMEOUT_MS", 5_000u64)?),
            worker_concurrency: env_parse("EMAIL_WORKER_CONCURRENCY", 4usize)?,
            worker_batch_size: env_parse("EMAIL_WORKER_BATCH_SIZE", 10usize)?,
            send,
            smtp: SmtpConfig::from_env()?,
            sweep,
            shutdown_grace: Duration::from_secs(env_parse("SHUTDOWN_GRACE_SECS", 30u64)?),
            request_timeout: Duration::from_secs(env_parse("HTTP_REQUEST_TIMEOUT_SECS", 30u64)?),
        })
    }
}
