//! Email Events Service
//!
//! One process serving the emails HTTP API, publishing creation events to
//! NATS JetStream and consuming them to deliver mail over SMTP.
//!
//! ## Architecture
//!
//! ```text
//! HTTP /api/v1/emails ──► EmailService ──► PostgreSQL (emails)
//!                              │    └────► Redis read cache (optional)
//!                              ▼
//!                 NATS JetStream (EMAIL_EVENTS)
//!                              │ (pull consumer: email-sender)
//!                              ▼
//!        NatsWorker<CreationEvent, CreationEventProcessor>
//!                              │
//!                              ▼
//!                 SendPipeline ──► SMTP relay
//!
//! PublishedSweeper: republishes events for records stuck in `published`
//! ```
//!
//! ## Shutdown
//!
//! SIGINT/SIGTERM stops the HTTP listener, the sweeper and the worker's
//! pulls. Messages already fetched keep processing; once
//! `SHUTDOWN_GRACE_SECS` passes, outstanding sends are cancelled and their
//! messages nak'd for redelivery.

pub mod config;

use axum::http::StatusCode;
use axum::Router;
use config::EmailServiceConfig;
use core_config::{Environment, FromEnv};
use database::common::RetryConfig;
use database::postgres::DatabaseConnection;
use domain_emails::{
    handlers, CreationEvent, CreationEventProcessor, EmailCache, EmailEventsStream, EmailService,
    NatsEventPublisher, NoopEmailCache, PgEmailStore, PublishedSweeper, RedisEmailCache,
    SendPipeline,
};
use email::{MailTransport, SmtpTransport};
use eyre::{Result, WrapErr};
use messaging::nats::{HealthServer, HealthState, NatsProducer, NatsWorker, WorkerConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};

/// Run the service until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if:
/// - Configuration is missing or malformed
/// - PostgreSQL or NATS cannot be reached at startup
/// - Migrations fail
/// - The HTTP listener cannot bind
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let metrics_handle =
        messaging::nats::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let config = EmailServiceConfig::from_env().wrap_err("Failed to load configuration")?;

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        ?environment,
        "Starting email service"
    );

    let db = database::postgres::connect_from_config_with_retry(
        config.postgres.clone(),
        Some(RetryConfig::new().with_max_retries(5)),
    )
    .await
    .wrap_err("Failed to connect to PostgreSQL")?;

    if config.run_migrations {
        database::postgres::run_migrations::<migration::Migrator>(&db, "email-service")
            .await
            .wrap_err("Failed to run migrations")?;
    }

    let health = HealthState::new();
    let health_router = HealthServer::new(health.clone())
        .with_metrics(metrics_handle)
        .router();

    match config.redis_url.clone() {
        Some(url) => {
            match database::redis::connect_with_retry(
                &url,
                Some(RetryConfig::new().with_max_retries(3)),
            )
            .await
            {
                Ok(manager) => {
                    let cache = Arc::new(RedisEmailCache::new(manager));
                    serve(config, db, cache, health, health_router).await
                }
                Err(e) => {
                    warn!(error = %e, "Redis unreachable, running without read cache");
                    serve(config, db, Arc::new(NoopEmailCache), health, health_router).await
                }
            }
        }
        None => {
            info!("REDIS_URL not set, read cache disabled");
            serve(config, db, Arc::new(NoopEmailCache), health, health_router).await
        }
    }
}

async fn serve<C>(
    config: EmailServiceConfig,
    db: DatabaseConnection,
    cache: Arc<C>,
    health: HealthState,
    health_router: Router,
) -> Result<()>
where
    C: EmailCache + 'static,
{
    info!(url = %config.nats_url, "Connecting to NATS...");
    let nats_client = async_nats::connect(&config.nats_url)
        .await
        .wrap_err_with(|| format!("Failed to connect to NATS at {}", config.nats_url))?;
    let max_payload = nats_client.server_info().max_payload;
    let jetstream = async_nats::jetstream::new(nats_client);
    info!(max_payload, "Connected to NATS");

    let store = Arc::new(PgEmailStore::new(db));
    let publisher = Arc::new(NatsEventPublisher::new(
        NatsProducer::from_stream_config::<EmailEventsStream>(jetstream.clone())
            .with_ack_timeout(config.publish_timeout)
            .with_max_payload(max_payload),
    ));

    let transport =
        SmtpTransport::new(config.smtp.clone()).wrap_err("Invalid SMTP configuration")?;
    if let Err(e) = transport.health_check().await {
        // Sends fail as transient and are redelivered until the relay is back.
        warn!(host = %config.smtp.host, error = %e, "SMTP relay not reachable at startup");
    }
    let pipeline = SendPipeline::new(transport, config.send.clone());

    let cancel = CancellationToken::new();

    let service = EmailService::new(
        store.clone(),
        cache.clone(),
        publisher.clone(),
        pipeline.clone(),
    )
    .with_cache_ttl(config.cache_ttl)
    .with_cancellation(cancel.clone());

    let processor = Arc::new(CreationEventProcessor::new(
        store.clone(),
        cache.clone(),
        pipeline,
        cancel.clone(),
    ));
    let worker_config = WorkerConfig::from_stream::<EmailEventsStream>()
        .with_batch_size(config.worker_batch_size)
        .with_max_concurrent_jobs(config.worker_concurrency);
    if config.send_outlasts(worker_config.ack_wait) {
        warn!(
            send_budget_ms = config.send.worst_case().as_millis() as u64,
            ack_wait_secs = worker_config.ack_wait.as_secs(),
            "Send retry budget exceeds the ack wait; in-flight messages rely on progress acks"
        );
    }
    let worker = NatsWorker::<CreationEvent, _>::new(jetstream, processor, worker_config, health)
        .await
        .wrap_err("Failed to create NATS worker")?;

    let sweeper = PublishedSweeper::new(store, cache, publisher, config.sweep.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn({
        let cancel = cancel.clone();
        let grace = config.shutdown_grace;
        async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);

            tokio::time::sleep(grace).await;
            if !cancel.is_cancelled() {
                warn!(
                    grace_secs = grace.as_secs(),
                    "Grace period elapsed, cancelling in-flight sends"
                );
                cancel.cancel();
            }
        }
    });

    let worker_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { worker.run(shutdown_rx).await }
    });
    let sweeper_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { sweeper.run(shutdown_rx).await }
    });

    let app = Router::new()
        .nest("/api/v1/emails", handlers::router(service))
        .merge(health_router)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );

    let addr = config.server.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind HTTP listener to {}", addr))?;
    info!(%addr, "HTTP server listening");

    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .wrap_err("HTTP server failed")?;

    match worker_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "NATS worker stopped with error"),
        Err(e) => error!(error = %e, "NATS worker task panicked"),
    }
    if let Err(e) = sweeper_handle.await {
        error!(error = %e, "Sweeper task panicked");
    }

    cancel.cancel();
    info!("Email service stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
