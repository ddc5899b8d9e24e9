//! # Reply Loop
//!
//! Consumes the orchestrator's reply tube. Each reply is reduced into the
//! matching in-memory job, the resulting delta is written through to the
//! backend, and the job is finished once everything sent has been
//! processed. Replies that cannot be matched or decoded are buried for
//! operator inspection; loop-level failures reconnect and keep going.

use tracing::{debug, error, info, warn};

use xjob_shared::bus::messages::ReplyMessage;
use xjob_shared::bus::{BusJob, BusListener};
use xjob_shared::job::record::JobStatus;

use super::Orchestrator;

impl Orchestrator {
    pub(super) async fn reply_loop(&self) {
        'reconnect: while !self.shutdown.is_cancelled() {
            let mut listener = match self
                .bus
                .listener(&self.config.reply_addr, &self.config.reply_tube)
                .await
            {
                Ok(listener) => listener,
                Err(err) => {
                    warn!(
                        addr = %self.config.reply_addr,
                        tube = %self.config.reply_tube,
                        error = %err,
                        "Cannot listen for replies, retrying"
                    );
                    if self.sleep_or_shutdown(self.config.discovery_interval).await {
                        break;
                    }
                    continue;
                }
            };
            info!(
                addr = %self.config.reply_addr,
                tube = %self.config.reply_tube,
                "Listening for task replies"
            );

            loop {
                let reserved = tokio::select! {
                    _ = self.shutdown.cancelled() => break 'reconnect,
                    reserved = listener.reserve(self.config.reply_reserve_timeout) => reserved,
                };
                match reserved {
                    Ok(Some(bus_job)) => self.handle_reply(&mut listener, bus_job).await,
                    Ok(None) => {}
                    Err(err) => {
                        error!(error = %err, "Failed to fetch task replies, reconnecting");
                        continue 'reconnect;
                    }
                }
            }
        }
        info!("Reply loop exited");
    }

    async fn handle_reply(&self, listener: &mut BusListener, bus_job: BusJob) {
        let reply: ReplyMessage = match serde_json::from_slice(&bus_job.payload) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "Burying undecodable reply");
                self.bury(listener, bus_job.id).await;
                return;
            }
        };

        let job = self.jobs.read().await.get(&reply.job_id).cloned();
        let Some(job) = job else {
            warn!(job_id = %reply.job_id, "Burying reply for unknown job");
            self.bury(listener, bus_job.id).await;
            return;
        };

        let (delta, finished) = {
            let mut job = job.lock().await;
            let delta = job.on_reply(&reply);
            (delta, job.is_finished())
        };

        match self.backend.update(&reply.job_id, &delta).await {
            Ok(record) => {
                match record.job.status {
                    JobStatus::Running => {
                        if finished {
                            self.try_finish(&reply.job_id).await;
                        }
                    }
                    // Replies for a paused job still count; the job stays
                    // loaded until it is resumed or taken elsewhere.
                    JobStatus::Paused => {}
                    status => {
                        debug!(job_id = %reply.job_id, status = %status, "Dropping terminal job");
                        self.remove_job(&reply.job_id).await;
                    }
                }
                if let Err(err) = listener.delete(bus_job.id).await {
                    warn!(error = %err, "Failed to acknowledge reply");
                }
            }
            Err(err) => {
                error!(
                    job_id = %reply.job_id,
                    error = %err,
                    "Failed to persist reply, burying it"
                );
                self.bury(listener, bus_job.id).await;
            }
        }
    }

    async fn bury(&self, listener: &mut BusListener, id: u64) {
        if let Err(err) = listener.bury(id).await {
            warn!(error = %err, "Failed to bury reply");
        }
    }
}
