//! # xjob Worker
//!
//! Runs one worker process against the local bus endpoint.
//!
//! ```bash
//! XJOB_CONFIG_PATH=/etc/xjob/xjob.toml xjob-worker
//! ```

use tokio::signal;
use tracing::info;

use xjob_shared::bus::BusProvider;
use xjob_shared::config::XjobConfig;
use xjob_shared::logging;
use xjob_worker::{Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_tracing();

    let config = XjobConfig::load()?;
    let worker_config = WorkerConfig::try_from(&config)?;
    let worker = Worker::new(worker_config, BusProvider::Beanstalk);

    let shutdown = worker.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    worker.run().await?;
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
