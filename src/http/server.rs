//! HTTP health server.
//!
//! # Responsibilities
//! - Serve `/live`, `/ready` and `/_health` from the health registry
//! - Wire up middleware (request timeout, tracing)
//! - Shut down gracefully on cancellation, within a fixed deadline
//!
//! # Design Decisions
//! - 200 when every selected check passes, 503 otherwise
//! - In-flight requests still running at the deadline are aborted

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::health::{HealthAggregator, HealthReport, View};
use crate::lifecycle::service::{Service, ServiceError};

/// Build the health router with all middleware layers.
#[allow(deprecated)]
pub fn router(health: Arc<HealthAggregator>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/_health", get(combined))
        .with_state(health)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
}

async fn live(State(health): State<Arc<HealthAggregator>>) -> (StatusCode, Json<HealthReport>) {
    respond(health.evaluate(View::Live))
}

async fn ready(State(health): State<Arc<HealthAggregator>>) -> (StatusCode, Json<HealthReport>) {
    respond(health.evaluate(View::Ready))
}

async fn combined(
    State(health): State<Arc<HealthAggregator>>,
) -> (StatusCode, Json<HealthReport>) {
    respond(health.evaluate(View::All))
}

fn respond(report: HealthReport) -> (StatusCode, Json<HealthReport>) {
    let status = if report.is_up() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// Runs the health router on a pre-bound listener.
pub struct HttpService {
    listener: Mutex<Option<TcpListener>>,
    router: Router,
    shutdown_timeout: Duration,
}

impl HttpService {
    /// Wrap a bound listener and router.
    pub fn new(listener: TcpListener, router: Router, shutdown_timeout: Duration) -> Self {
        Self {
            listener: Mutex::new(Some(listener)),
            router,
            shutdown_timeout,
        }
    }
}

#[async_trait]
impl Service for HttpService {
    fn name(&self) -> &str {
        "http"
    }

    async fn run(&self, token: CancellationToken) -> Result<(), ServiceError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ServiceError::AlreadyStarted)?;

        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let router = self.router.clone();
        let shutdown = token.clone().cancelled_owned();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
        });

        tokio::select! {
            joined = &mut server => return finished(joined),
            _ = token.cancelled() => {}
        }

        match tokio::time::timeout(self.shutdown_timeout, &mut server).await {
            Ok(joined) => finished(joined)?,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "HTTP graceful shutdown timed out, aborting open requests"
                );
                server.abort();
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

fn finished(joined: Result<io::Result<()>, JoinError>) -> Result<(), ServiceError> {
    match joined {
        Ok(result) => Ok(result?),
        Err(e) => Err(ServiceError::Io(io::Error::other(e))),
    }
}
