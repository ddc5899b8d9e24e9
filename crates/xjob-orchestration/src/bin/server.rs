//! # xjob Control API Server
//!
//! Serves the HTTP control surface on the configured listen address.
//!
//! ```bash
//! XJOB_CONFIG_PATH=/etc/xjob/xjob.toml xjob-server
//! ```

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use xjob_orchestration::api::{self, ApiState};
use xjob_shared::backend::JobBackend;
use xjob_shared::config::XjobConfig;
use xjob_shared::modules::ModuleRegistry;
use xjob_shared::logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_tracing();

    let config = XjobConfig::load()?;
    let backend = JobBackend::from_endpoint(&config.backend_endpoint).await?;

    info!(
        listen = %config.api_listen,
        backend = backend.backend_name(),
        "Starting xjob control API"
    );

    let state = ApiState {
        backend,
        registry: Arc::new(ModuleRegistry::builtin()),
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    api::serve(state, &config.api_listen, shutdown).await?;
    info!("Control API shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
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
