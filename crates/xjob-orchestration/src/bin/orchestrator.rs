//! # xjob Orchestrator
//!
//! Runs the job execution loops against the configured backend, bus and
//! membership service. The first Ctrl+C/SIGTERM drains gracefully: dispatch
//! tasks stop after their current message and running jobs stay claimable
//! by a restart under the same orchestrator id. A second signal exits
//! immediately.
//!
//! ```bash
//! XJOB_CONFIG_PATH=/etc/xjob/xjob.toml xjob-orchestrator
//! ```

use std::sync::Arc;

use tokio::signal;
use tracing::{info, warn};

use xjob_orchestration::orchestrator::{Orchestrator, OrchestratorConfig};
use xjob_shared::backend::JobBackend;
use xjob_shared::bus::BusProvider;
use xjob_shared::config::XjobConfig;
use xjob_shared::directory::DirectoryClient;
use xjob_shared::logging;
use xjob_shared::modules::ModuleRegistry;
use xjob_shared::XjobError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_tracing();

    let config = XjobConfig::load()?;
    let backend = JobBackend::from_endpoint(&config.backend_endpoint).await?;
    let directory = match &config.directory_endpoint {
        Some(endpoint) => DirectoryClient::http(endpoint),
        None => {
            return Err(Box::new(XjobError::Config(
                "directory_endpoint is required by the orchestrator".to_string(),
            )) as Box<dyn std::error::Error>)
        }
    };

    let orchestrator = Orchestrator::new(
        OrchestratorConfig::from(&config),
        backend,
        Arc::new(ModuleRegistry::builtin()),
        BusProvider::Beanstalk,
        directory,
    );

    let shutdown = orchestrator.shutdown_token();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Exiting gracefully, signal again to abort");
        shutdown.cancel();

        wait_for_signal().await;
        warn!("Exiting immediately");
        std::process::exit(1);
    });

    orchestrator.run().await?;
    info!("Orchestrator shutdown complete");
    Ok(())
}

/// Wait for one Ctrl+C or SIGTERM.
async fn wait_for_signal() {
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
