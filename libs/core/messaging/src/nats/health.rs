//! Health endpoints for K8s probes.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of the worker.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub stream_connected: bool,
    pub processor_healthy: bool,
}

/// Shared health state, updated by the worker loop.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<RwLock<HealthStateInner>>,
}

struct HealthStateInner {
    stream_connected: bool,
    processor_healthy: bool,
    last_error: Option<String>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthStateInner {
                stream_connected: true,
                processor_healthy: true,
                last_error: None,
            })),
        }
    }

    /// Record the outcome of the last pull.
    pub async fn set_stream_connected(&self, connected: bool, error: Option<String>) {
        let mut inner = self.inner.write().await;
        inner.stream_connected = connected;
        if error.is_some() || connected {
            inner.last_error = error;
        }
    }

    pub async fn set_processor_healthy(&self, healthy: bool) {
        let mut inner = self.inner.write().await;
        inner.processor_healthy = healthy;
    }

    /// Liveness: only a broken processor restarts the pod, not a broker blip.
    pub async fn is_alive(&self) -> bool {
        self.inner.read().await.processor_healthy
    }

    /// Readiness.
    pub async fn is_healthy(&self) -> bool {
        let inner = self.inner.read().await;
        inner.stream_connected && inner.processor_healthy
    }

    pub async fn status(&self) -> HealthStatus {
        let inner = self.inner.read().await;
        let status = if inner.stream_connected && inner.processor_healthy {
            "healthy".to_string()
        } else {
            format!(
                "unhealthy: {}",
                inner.last_error.as_deref().unwrap_or("unknown")
            )
        };

        HealthStatus {
            status,
            stream_connected: inner.stream_connected,
            processor_healthy: inner.processor_healthy,
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Router serving `/health`, `/ready` and optionally `/metrics`.
pub struct HealthServer {
    state: HealthState,
    metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl HealthServer {
    pub fn new(state: HealthState) -> Self {
        Self {
            state,
            metrics_handle: None,
        }
    }

    /// Set the metrics handle for /metrics endpoint.
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/readyz", get(ready_handler))
            .with_state(self.state.clone());

        if let Some(handle) = self.metrics_handle.clone() {
            router = router.route(
                "/metrics",
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }

        router
    }
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let status = state.status().await;
    if state.is_alive().await {
        (StatusCode::OK, Json(status))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(status))
    }
}

async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let status = state.status().await;
    if state.is_healthy().await {
        (StatusCode::OK, Json(status))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(status))
    }
}
