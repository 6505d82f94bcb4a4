//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT)
//! - Report which signal requested termination
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The caller turns the first signal into the shutdown broadcast

use std::io;

/// Wait for SIGINT or SIGTERM and return its name.
#[cfg(unix)]
pub async fn termination_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

/// Wait for Ctrl+C.
#[cfg(not(unix))]
pub async fn termination_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
