//! # Dispatch Task
//!
//! One per running job: pulls the module's task stream from the persisted
//! cursor, paces it at `items.max_per_second`, round-robins each message
//! across the current worker set and writes the progress delta through to
//! the backend after every send. A dispatch error fails only this job;
//! shutdown returns early without failing anything.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use xjob_shared::bus::messages::{ReplyAddress, TaskMessage};
use xjob_shared::bus::{BusProvider, BusSender};
use xjob_shared::job::record::JobStatus;
use xjob_shared::job::Job;
use xjob_shared::modules::TaskStream;
use xjob_shared::ratelimit::RateLimiter;
use xjob_shared::XjobResult;

use super::Orchestrator;

enum DispatchEnd {
    /// Stream exhausted, every item sent
    Completed,
    /// Shutdown fired mid-stream; the job stays RUNNING for recovery
    Shutdown,
    /// The job left RUNNING under us (operator pause or external fail)
    Stopped(JobStatus),
}

pub(super) async fn dispatch_job(orch: Orchestrator, job: Arc<Mutex<Job>>) {
    let (job_id, job_type, rate, stream) = {
        let job = job.lock().await;
        (
            job.id().to_string(),
            job.job_type().to_string(),
            job.max_per_second(),
            job.tasks(),
        )
    };
    info!(job_id = %job_id, job_type = %job_type, "Dispatching tasks");

    match run_stream(&orch, &job, &job_id, rate, stream).await {
        Ok(DispatchEnd::Completed) => {
            let delta = job.lock().await.on_all_sent();
            match orch.backend.update(&job_id, &delta).await {
                Ok(_) => {
                    info!(job_id = %job_id, job_type = %job_type, "All tasks sent");
                }
                Err(err) => {
                    error!(job_id = %job_id, error = %err, "Failed to record end of stream");
                }
            }
            // Every reply may already be in; nobody else will notice then.
            let finished = job.lock().await.is_finished();
            if finished {
                orch.try_finish(&job_id).await;
            }
        }
        Ok(DispatchEnd::Shutdown) => {
            debug!(job_id = %job_id, "Dispatch interrupted by shutdown");
        }
        Ok(DispatchEnd::Stopped(status)) => {
            info!(job_id = %job_id, status = %status, "Job left RUNNING, dispatch stopped");
            if status != JobStatus::Paused {
                orch.remove_job(&job_id).await;
            }
        }
        Err(err) => {
            error!(
                job_id = %job_id,
                job_type = %job_type,
                error = %err,
                "Failed to dispatch tasks"
            );
            if let Err(err) = orch.backend.fail(&job_id, Some(&err.to_string())).await {
                error!(job_id = %job_id, error = %err, "Failed to mark job failed");
            }
            orch.remove_job(&job_id).await;
        }
    }
}

async fn run_stream(
    orch: &Orchestrator,
    job: &Arc<Mutex<Job>>,
    job_id: &str,
    rate: u32,
    mut stream: TaskStream,
) -> XjobResult<DispatchEnd> {
    let mut limiter = RateLimiter::per_second(rate);
    let mut workers = WorkerCursor::new(orch);
    let reply_to = ReplyAddress {
        addr: orch.config.reply_addr.clone(),
        tube: orch.config.reply_tube.clone(),
    };

    loop {
        let next = tokio::select! {
            _ = orch.shutdown.cancelled() => return Ok(DispatchEnd::Shutdown),
            next = stream.next() => next,
        };
        let Some(spec) = next.transpose()? else {
            return Ok(DispatchEnd::Completed);
        };

        limiter.acquire().await;

        let message = TaskMessage {
            job_id: job_id.to_string(),
            task: spec.task,
            item: spec.item.clone(),
            kwargs: spec.kwargs,
            beanstalkd_reply: reply_to.clone(),
        };
        let payload = serde_json::to_vec(&message)?;

        if !workers.send(&payload).await? {
            return Ok(DispatchEnd::Shutdown);
        }

        let delta = job.lock().await.on_sent(&spec.item);
        let record = orch.backend.update(job_id, &delta).await?;
        if record.job.status != JobStatus::Running {
            return Ok(DispatchEnd::Stopped(record.job.status));
        }
    }
}

/// Round-robin over the live worker set with cached connections.
///
/// A full worker advances the cursor; when every worker is full the cursor
/// logs once and backs off before sweeping again.
struct WorkerCursor {
    bus: BusProvider,
    tube: String,
    workers_rx: watch::Receiver<Arc<Vec<String>>>,
    shutdown: CancellationToken,
    full_backoff: Duration,
    next: usize,
    senders: HashMap<String, BusSender>,
}

impl WorkerCursor {
    fn new(orch: &Orchestrator) -> Self {
        Self {
            bus: orch.bus.clone(),
            tube: orch.config.workers_tube.clone(),
            workers_rx: orch.workers_tx.subscribe(),
            shutdown: orch.shutdown.clone(),
            full_backoff: orch.config.full_backoff,
            next: 0,
            senders: HashMap::new(),
        }
    }

    /// Enqueue `payload` on some worker. False when shutdown fired while
    /// waiting for capacity.
    async fn send(&mut self, payload: &[u8]) -> XjobResult<bool> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(false);
            }

            let workers = self.workers_rx.borrow().clone();
            if workers.is_empty() {
                warn!(tube = %self.tube, "No bus worker available");
            } else {
                let count = workers.len();
                for _ in 0..count {
                    self.next %= count;
                    let addr = workers[self.next].clone();
                    self.next += 1;

                    match self.try_send_to(&addr, payload).await {
                        Ok(true) => return Ok(true),
                        Ok(false) => {}
                        Err(err) => {
                            debug!(addr = %addr, error = %err, "Bus endpoint unusable");
                        }
                    }
                }
                warn!(tube = %self.tube, "All bus workers are full");
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.full_backoff) => {}
            }
        }
    }

    async fn try_send_to(&mut self, addr: &str, payload: &[u8]) -> XjobResult<bool> {
        if !self.senders.contains_key(addr) {
            let sender = self.bus.sender(addr, &self.tube).await?;
            self.senders.insert(addr.to_string(), sender);
        }
        let Some(sender) = self.senders.get_mut(addr) else {
            return Ok(false);
        };
        let sent = sender.try_put(payload).await;
        if sent.is_err() {
            // Stale connection; reconnect on the next round.
            self.senders.remove(addr);
        }
        sent
    }
}
