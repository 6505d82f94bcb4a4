//! Startup orchestration.
//!
//! # Responsibilities
//! - Connect to the broker and declare the queue topology
//! - Register health probes
//! - Bind listeners and build the services
//! - Run every service until termination
//!
//! # Design Decisions
//! - Fail fast: a broker connect failure is fatal, before any listener binds
//! - Subsystems initialize in order, not concurrently
//! - Listeners start last (traffic only when ready)

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::amqp::{ConnectError, ConnectionManager, Dialer};
use crate::config::AppConfig;
use crate::health::{CheckKind, HealthAggregator};
use crate::http::{router, HttpService};
use crate::lifecycle::runner::{ApplicationRunner, RunError};
use crate::lifecycle::shutdown::ShutdownCoordinator;
use crate::net::SessionTracker;
use crate::smtp::{QueueBackend, SmtpService};

/// Check name of the broker readiness probe.
pub const AMQP_CHECK: &str = "amqp_check";
/// Check name of the open-session liveness probe.
pub const SESSION_CHECK: &str = "session-threshold";

/// How long services get to acknowledge termination before stragglers are reported.
const ACKNOWLEDGE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why the application stopped with a failure.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to connect to broker: {0}")]
    Connect(#[from] ConnectError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Run(#[from] RunError),
}

/// Start every subsystem and run until termination is requested or a
/// service fails.
pub async fn run(
    config: AppConfig,
    dialer: &dyn Dialer,
    shutdown: &ShutdownCoordinator,
) -> Result<(), StartupError> {
    tracing::info!(
        broker = %format!("{}:{}", config.amqp.host, config.amqp.port),
        queue = %config.amqp.queue,
        smtp_address = %config.smtp.addr,
        http_address = %config.http.addr,
        "Starting"
    );

    let connection = Arc::new(ConnectionManager::new(config.amqp.clone()));
    connection.connect(dialer).await?;

    // Background probe refreshers stop when startup returns.
    let probes = CancellationToken::new();
    let _probes_guard = probes.clone().drop_guard();

    let health = Arc::new(HealthAggregator::new());
    let amqp_probe = match config.amqp.health_interval() {
        Some(every) => connection.probe().refreshed_every(every, probes.child_token()),
        None => connection.probe(),
    };
    health.register(AMQP_CHECK, CheckKind::Readiness, amqp_probe);

    let sessions = SessionTracker::new();
    let session_probe = sessions
        .threshold_probe(config.health.max_active_sessions)
        .cached(Duration::from_millis(config.health.cache_ttl_ms));
    health.register(SESSION_CHECK, CheckKind::Liveness, session_probe);

    let (smtp_listener, http_listener) = match bind_listeners(&config).await {
        Ok(listeners) => listeners,
        Err(e) => {
            if let Err(close) = connection.shutdown().await {
                tracing::warn!(error = %close, "Failed to close broker connection");
            }
            return Err(e);
        }
    };

    let backend = Arc::new(QueueBackend::new(
        connection.clone(),
        config.smtp.login.clone(),
        config.smtp.password.clone(),
    ));
    let smtp = SmtpService::new(smtp_listener, backend, &config.smtp, sessions);
    let http = HttpService::new(
        http_listener,
        router(
            Arc::clone(&health),
            Duration::from_secs(config.http.request_timeout_secs),
        ),
        Duration::from_millis(config.http.shutdown_timeout_ms),
    );

    let mut runner = ApplicationRunner::new(shutdown.clone());
    runner.register(Arc::new(http));
    runner.register(Arc::new(smtp));
    runner.register(connection);

    tracing::info!(services = runner.len(), "Services registered, running");
    let run = runner.run(CancellationToken::new());
    tokio::pin!(run);

    let result = tokio::select! {
        biased;
        result = &mut run => result,
        _ = shutdown.requested() => {
            if let Err(e) = shutdown.barrier().wait_timeout(ACKNOWLEDGE_TIMEOUT).await {
                tracing::warn!(error = %e, "Services still stopping");
            }
            run.await
        }
    };
    tracing::info!("All services stopped");

    result.map_err(StartupError::from)
}

async fn bind_listeners(config: &AppConfig) -> Result<(TcpListener, TcpListener), StartupError> {
    let smtp = bind(&config.smtp.addr).await?;
    let http = bind(&config.http.addr).await?;
    Ok((smtp, http))
}

async fn bind(addr: &str) -> Result<TcpListener, StartupError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    if let Ok(local) = listener.local_addr() {
        tracing::info!(address = %local, "Listener bound");
    }
    Ok(listener)
}
