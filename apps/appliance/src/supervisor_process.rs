//! The parent (supervisor) process role (§4.E).
//!
//! Owns the broker, state store, and webserver peer stub, and runs the
//! capture child under [`tuner_core::supervisor::Supervisor`] until an OS
//! shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tuner_core::events::LoggingEventEmitter;
use tuner_core::supervisor::Supervisor;
use tuner_core::{bootstrap_services, Config};

pub async fn run(config: Config, child_args: Vec<String>) -> Result<()> {
    let services = bootstrap_services(&config)
        .await
        .context("failed to bootstrap supervisor services")?;

    let exe = std::env::current_exe().context("failed to resolve current executable path")?;
    let supervisor = Supervisor::new(
        exe,
        child_args.into_iter().map(Into::into).collect(),
        config.restart_exit_code,
        Arc::new(LoggingEventEmitter),
    );

    let supervisor_cancel = CancellationToken::new();
    let child_cancel = supervisor_cancel.clone();

    let supervisor_handle = tokio::spawn(async move {
        if let Err(e) = supervisor.run(child_cancel).await {
            log::error!("capture child supervision failed: {e}");
        }
    });

    shutdown_signal().await;
    log::info!("supervisor: shutdown signal received");

    // Stop the capture child first (§2.A ordering note), then tear down the
    // parent-owned services.
    supervisor_cancel.cancel();
    let _ = supervisor_handle.await;

    services.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
