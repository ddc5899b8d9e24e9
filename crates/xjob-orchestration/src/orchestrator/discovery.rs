//! # Worker Discovery
//!
//! Periodically rebuilds the set of bus endpoints that host workers: every
//! known bus service with a positive score whose tube listing advertises
//! the configured workers tube. The set is published through the watch
//! channel as one atomic pointer replacement; on any failure the previous
//! set stays in place.

use std::sync::Arc;

use tracing::{debug, info, warn};

use xjob_shared::{XjobError, XjobResult};

use super::Orchestrator;

/// Service type bus endpoints register under in the directory
const BUS_SERVICE_TYPE: &str = "beanstalkd";

impl Orchestrator {
    pub(super) async fn discovery_loop(&self) {
        loop {
            match self.refresh_workers().await {
                Ok(workers) => {
                    let workers = Arc::new(workers);
                    let previous = self.workers_tx.send_replace(workers.clone());
                    if *previous != *workers {
                        info!(
                            workers = ?workers,
                            tube = %self.config.workers_tube,
                            "Bus worker set changed"
                        );
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Failed to refresh bus workers");
                }
            }
            if self.sleep_or_shutdown(self.config.discovery_interval).await {
                break;
            }
        }
        info!("Worker discovery loop exited");
    }

    async fn refresh_workers(&self) -> XjobResult<Vec<String>> {
        let services = self.directory.all_services(BUS_SERVICE_TYPE).await?;

        let mut workers = Vec::new();
        for service in services {
            if service.score <= 0 {
                continue;
            }
            let tubes = self.bus.tubes(&service.addr).await?;
            if tubes.iter().any(|tube| *tube == self.config.workers_tube) {
                debug!(
                    addr = %service.addr,
                    tube = %self.config.workers_tube,
                    "Endpoint advertises the workers tube"
                );
                workers.push(service.addr);
            }
        }

        if workers.is_empty() {
            return Err(XjobError::bus_unavailable(format!(
                "no bus endpoint advertises tube {:?}",
                self.config.workers_tube
            )));
        }
        Ok(workers)
    }
}
