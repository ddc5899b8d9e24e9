//! # Orchestrator
//!
//! The long-running process that executes jobs: it discovers bus workers,
//! claims waiting jobs from the backend, streams rate-limited tasks to the
//! workers and folds their replies back into job state. Three loops plus
//! one dispatch task per running job, all cooperating on one cancellation
//! token:
//!
//! - discovery loop: refreshes the worker set every few seconds
//! - claim loop: polls the backend for claimable jobs
//! - reply loop: consumes the orchestrator's reply tube
//!
//! A crash loses nothing durable: on startup the orchestrator re-hydrates
//! every job still assigned to its id and resumes dispatch from the
//! persisted `items.last_sent` cursor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use xjob_shared::backend::JobBackend;
use xjob_shared::bus::BusProvider;
use xjob_shared::config::XjobConfig;
use xjob_shared::directory::DirectoryClient;
use xjob_shared::job::record::{JobRecord, JobStatus};
use xjob_shared::job::Job;
use xjob_shared::modules::ModuleRegistry;
use xjob_shared::{XjobError, XjobResult};

mod discovery;
mod dispatch;
mod replies;

/// Tunables and identity of one orchestrator process
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub orchestrator_id: String,
    /// Reply destination embedded in every task message
    pub reply_addr: String,
    pub reply_tube: String,
    /// Tube workers watch; discovery keeps endpoints advertising it
    pub workers_tube: String,
    pub claim_interval: Duration,
    pub discovery_interval: Duration,
    pub reply_reserve_timeout: Duration,
    /// Backoff when every worker reports full
    pub full_backoff: Duration,
}

impl From<&XjobConfig> for OrchestratorConfig {
    fn from(config: &XjobConfig) -> Self {
        Self {
            orchestrator_id: config.orchestrator_id(),
            reply_addr: config.beanstalkd_reply_addr.clone(),
            reply_tube: config.beanstalkd_reply_tube.clone(),
            workers_tube: config.beanstalkd_workers_tube.clone(),
            claim_interval: Duration::from_secs(config.claim_interval_secs),
            discovery_interval: Duration::from_secs(config.refresh_interval_secs),
            reply_reserve_timeout: Duration::from_secs(1),
            full_backoff: Duration::from_secs(5),
        }
    }
}

type RunningJobs = Arc<RwLock<HashMap<String, Arc<Mutex<Job>>>>>;

/// One orchestrator process. Cheap to clone; every clone shares the same
/// running-jobs map, worker-set pointer and shutdown token.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    backend: JobBackend,
    registry: Arc<ModuleRegistry>,
    bus: BusProvider,
    directory: DirectoryClient,
    /// Current worker set, replaced atomically by the discovery loop
    workers_tx: Arc<watch::Sender<Arc<Vec<String>>>>,
    jobs: RunningJobs,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        backend: JobBackend,
        registry: Arc<ModuleRegistry>,
        bus: BusProvider,
        directory: DirectoryClient,
    ) -> Self {
        let (workers_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            config: Arc::new(config),
            backend,
            registry,
            bus,
            directory,
            workers_tx: Arc::new(workers_tx),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelling every loop; the first shutdown signal cancels it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown: discovery, startup recovery, reply loop, claim
    /// loop, then drain the dispatch tasks.
    pub async fn run(&self) -> XjobResult<()> {
        info!(
            orchestrator_id = %self.config.orchestrator_id,
            backend = self.backend.backend_name(),
            bus = self.bus.provider_name(),
            "Starting orchestrator"
        );

        let this = self.clone();
        self.tracker
            .spawn(async move { this.discovery_loop().await });

        if !self.wait_for_workers().await {
            self.drain().await;
            return Ok(());
        }

        self.recover().await;

        let this = self.clone();
        self.tracker.spawn(async move { this.reply_loop().await });

        self.claim_loop().await;
        self.drain().await;
        Ok(())
    }

    async fn drain(&self) {
        info!("Draining orchestrator tasks");
        self.tracker.close();
        self.tracker.wait().await;
        info!("Orchestrator exited");
    }

    /// Block until discovery publishes a non-empty worker set. False when
    /// shutdown fired first.
    async fn wait_for_workers(&self) -> bool {
        let mut workers_rx = self.workers_tx.subscribe();
        info!("Waiting until bus workers are found");
        loop {
            if !workers_rx.borrow_and_update().is_empty() {
                return true;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                changed = workers_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Re-hydrate every job still assigned to this orchestrator id; they
    /// were RUNNING or PAUSED before a restart.
    async fn recover(&self) {
        let assigned = match self
            .backend
            .list_orchestrator(&self.config.orchestrator_id)
            .await
        {
            Ok(assigned) => assigned,
            Err(err) => {
                error!(error = %err, "Failed to list assigned jobs at startup");
                return;
            }
        };

        for record in assigned {
            info!(
                job_id = %record.job.id,
                job_type = %record.job.job_type,
                status = %record.job.status,
                "Found assigned job"
            );
            self.handle_job(record).await;
        }
    }

    /// Poll the backend for claimable jobs; claim again immediately after a
    /// success so a burst of waiting jobs starts without delay.
    async fn claim_loop(&self) {
        while !self.shutdown.is_cancelled() {
            match self.backend.claim(&self.config.orchestrator_id).await {
                Ok(Some(record)) => {
                    info!(
                        job_id = %record.job.id,
                        job_type = %record.job.job_type,
                        "Claimed new job"
                    );
                    self.handle_job(record).await;
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "Failed to claim a waiting job");
                }
            }
            if self.sleep_or_shutdown(self.config.claim_interval).await {
                break;
            }
        }
    }

    /// Load a record as an in-memory job and, when it is RUNNING, spawn its
    /// dispatch task. Instantiation failures fail the job.
    async fn handle_job(&self, record: JobRecord) {
        let job_id = record.job.id.clone();
        let job_type = record.job.job_type.clone();
        let status = record.job.status;

        match Job::load(&self.registry, record) {
            Ok(job) => {
                let job = Arc::new(Mutex::new(job));
                self.jobs.write().await.insert(job_id.clone(), job.clone());
                if status == JobStatus::Running {
                    let this = self.clone();
                    self.tracker
                        .spawn(async move { dispatch::dispatch_job(this, job).await });
                }
            }
            Err(err) => {
                error!(
                    job_id = %job_id,
                    job_type = %job_type,
                    error = %err,
                    "Failed to instantiate job"
                );
                if let Err(err) = self.backend.fail(&job_id, Some(&err.to_string())).await {
                    error!(job_id = %job_id, error = %err, "Failed to mark job failed");
                }
            }
        }
    }

    async fn remove_job(&self, job_id: &str) {
        self.jobs.write().await.remove(job_id);
    }

    /// Finish a job in the backend and drop it from the running map.
    /// Loses the race gracefully when the job already left RUNNING.
    async fn try_finish(&self, job_id: &str) {
        match self.backend.finish(job_id).await {
            Ok(()) => {
                info!(job_id = %job_id, "Job finished");
                self.remove_job(job_id).await;
            }
            Err(XjobError::BadState(reason)) => {
                tracing::debug!(job_id = %job_id, reason = %reason, "Finish skipped");
            }
            Err(err) => {
                error!(job_id = %job_id, error = %err, "Failed to finish job");
            }
        }
    }

    /// Sleep for `duration`, returning true when shutdown fired instead.
    async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
