//! # Worker Runtime
//!
//! The stateless execution loop: reserve a task message from the workers
//! tube, run the matching executor, post `{job_id, res, exc}` to the reply
//! address embedded in the message, then delete the reserved message.
//! Undecodable messages are buried; a reply tube reporting full is retried
//! with a short sleep. The reply connection is reopened whenever the reply
//! address changes mid-stream.

use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use xjob_shared::bus::messages::{ReplyAddress, ReplyMessage, TaskMessage};
use xjob_shared::bus::{BusJob, BusListener, BusProvider, BusSender};
use xjob_shared::config::XjobConfig;
use xjob_shared::{XjobError, XjobResult};

use crate::tasks::{TaskError, TaskRegistry};

/// Runtime settings for one worker process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Local bus endpoint this worker reserves task messages from
    pub beanstalkd_addr: String,
    pub workers_tube: String,
    pub reserve_timeout: Duration,
    /// Sleep between attempts when the reply tube reports full
    pub reply_retry_delay: Duration,
}

impl TryFrom<&XjobConfig> for WorkerConfig {
    type Error = XjobError;

    fn try_from(config: &XjobConfig) -> Result<Self, Self::Error> {
        let beanstalkd_addr = config
            .worker_beanstalkd_addr
            .clone()
            .filter(|addr| !addr.is_empty())
            .ok_or_else(|| {
                XjobError::Config("worker_beanstalkd_addr is required by the worker".to_string())
            })?;
        Ok(Self {
            beanstalkd_addr,
            workers_tube: config.beanstalkd_workers_tube.clone(),
            reserve_timeout: Duration::from_secs(1),
            reply_retry_delay: Duration::from_secs(1),
        })
    }
}

/// One worker process
#[derive(Debug)]
pub struct Worker {
    config: WorkerConfig,
    bus: BusProvider,
    registry: TaskRegistry,
    reply: Option<BusSender>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(config: WorkerConfig, bus: BusProvider) -> Self {
        Self {
            config,
            bus,
            registry: TaskRegistry::builtin(),
            reply: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Reserve and execute task messages until shutdown.
    pub async fn run(mut self) -> XjobResult<()> {
        info!(
            addr = %self.config.beanstalkd_addr,
            tube = %self.config.workers_tube,
            "Worker started"
        );

        'reconnect: while !self.shutdown.is_cancelled() {
            let mut listener = match self
                .bus
                .listener(&self.config.beanstalkd_addr, &self.config.workers_tube)
                .await
            {
                Ok(listener) => listener,
                Err(err) => {
                    warn!(error = %err, "Cannot watch the workers tube, retrying");
                    if self.sleep_or_shutdown(self.config.reply_retry_delay).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                let reserved = tokio::select! {
                    _ = self.shutdown.cancelled() => break 'reconnect,
                    reserved = listener.reserve(self.config.reserve_timeout) => reserved,
                };
                match reserved {
                    Ok(Some(bus_job)) => self.process_message(&mut listener, bus_job).await,
                    Ok(None) => {}
                    Err(err) => {
                        warn!(error = %err, "Failed to reserve a task, reconnecting");
                        continue 'reconnect;
                    }
                }
            }
        }

        info!("Worker exited");
        Ok(())
    }

    async fn process_message(&mut self, listener: &mut BusListener, bus_job: BusJob) {
        let message: TaskMessage = match serde_json::from_slice(&bus_job.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "Burying undecodable task message");
                if let Err(err) = listener.bury(bus_job.id).await {
                    warn!(error = %err, "Failed to bury task message");
                }
                return;
            }
        };

        let reqid = request_id(&message.job_id);
        let result = match self.registry.get(&message.task) {
            Some(executor) => {
                executor
                    .process(&message.item, &message.kwargs, &reqid)
                    .await
            }
            None => Err(TaskError::new(
                "UnknownTask",
                format!("no executor for token {:?}", message.task),
            )),
        };

        let reply = match result {
            Ok(res) => ReplyMessage::success(&message.job_id, Some(res)),
            Err(err) => {
                warn!(
                    job_id = %message.job_id,
                    item = %message.item,
                    error = %err,
                    "Task failed"
                );
                ReplyMessage::error(&message.job_id, err.into())
            }
        };
        self.send_reply(&message.beanstalkd_reply, &reply).await;

        if let Err(err) = listener.delete(bus_job.id).await {
            warn!(error = %err, "Failed to delete processed task");
        }
    }

    /// Post one reply, reconnecting when the reply address changed and
    /// retrying while the reply tube is full. An unreachable reply bus
    /// drops the reply with a log; the task itself is already done.
    async fn send_reply(&mut self, dest: &ReplyAddress, reply: &ReplyMessage) {
        let payload = match serde_json::to_vec(reply) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "Failed to encode reply");
                return;
            }
        };

        let stale = self
            .reply
            .as_ref()
            .is_none_or(|sender| sender.addr() != dest.addr || sender.tube() != dest.tube);
        if stale {
            match self.bus.sender(&dest.addr, &dest.tube).await {
                Ok(sender) => self.reply = Some(sender),
                Err(err) => {
                    warn!(
                        addr = %dest.addr,
                        tube = %dest.tube,
                        error = %err,
                        "Failed to reach the reply tube"
                    );
                    return;
                }
            }
        }

        while let Some(sender) = self.reply.as_mut() {
            match sender.try_put(&payload).await {
                Ok(true) => return,
                Ok(false) => {
                    if self.sleep_or_shutdown(self.config.reply_retry_delay).await {
                        return;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Failed to post reply");
                    self.reply = None;
                }
            }
        }
    }

    async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

/// Request id for one task execution, derived from the job id so platform
/// logs correlate back to the job.
fn request_id(job_id: &str) -> String {
    let suffix: u32 = rand::rng().random_range(0..u32::MAX);
    format!("{job_id}-{suffix:08X}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use xjob_shared::job::record::JsonMap;

    fn task_message(job_id: &str, task: &str, item: &str, reply_tube: &str) -> Vec<u8> {
        let message = TaskMessage {
            job_id: job_id.to_string(),
            task: task.to_string(),
            item: item.to_string(),
            kwargs: JsonMap::new(),
            beanstalkd_reply: ReplyAddress {
                addr: "orch:6005".to_string(),
                tube: reply_tube.to_string(),
            },
        };
        serde_json::to_vec(&message).unwrap()
    }

    fn test_worker(bus: &BusProvider) -> Worker {
        Worker::new(
            WorkerConfig {
                beanstalkd_addr: "w1:11300".to_string(),
                workers_tube: "xjob-work".to_string(),
                reserve_timeout: Duration::from_millis(20),
                reply_retry_delay: Duration::from_millis(20),
            },
            bus.clone(),
        )
    }

    #[tokio::test]
    async fn test_executes_task_and_replies() {
        let bus = BusProvider::new_in_memory();
        let mut reply_listener = bus.listener("orch:6005", "reply-a").await.unwrap();
        let mut sender = bus.sender("w1:11300", "xjob-work").await.unwrap();

        let worker = test_worker(&bus);
        let shutdown = worker.shutdown_token();
        let handle = tokio::spawn(worker.run());

        sender
            .try_put(&task_message("job-1", "tester", "myitem-0", "reply-a"))
            .await
            .unwrap();

        let reply = reply_listener
            .reserve(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("worker should reply");
        let reply: ReplyMessage = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(reply.job_id, "job-1");
        assert!(reply.exc.is_none());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_token_replies_with_error() {
        let bus = BusProvider::new_in_memory();
        let mut reply_listener = bus.listener("orch:6005", "reply-b").await.unwrap();
        let mut sender = bus.sender("w1:11300", "xjob-work").await.unwrap();

        let worker = test_worker(&bus);
        let shutdown = worker.shutdown_token();
        let handle = tokio::spawn(worker.run());

        sender
            .try_put(&task_message("job-2", "warp-drive", "x", "reply-b"))
            .await
            .unwrap();

        let reply = reply_listener
            .reserve(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("worker should reply");
        let reply: ReplyMessage = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(reply.exc.unwrap()["class_name"], json!("UnknownTask"));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_message_is_buried() {
        let bus = BusProvider::new_in_memory();
        let mut sender = bus.sender("w1:11300", "xjob-work").await.unwrap();

        let worker = test_worker(&bus);
        let shutdown = worker.shutdown_token();
        let handle = tokio::spawn(worker.run());

        sender.try_put(b"not json at all").await.unwrap();

        let BusProvider::Memory(memory) = &bus else {
            panic!("expected the in-memory provider");
        };
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while memory.buried_count("w1:11300", "xjob-work") == 0 {
            assert!(tokio::time::Instant::now() < deadline, "nothing buried");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reply_connection_follows_address_changes() {
        let bus = BusProvider::new_in_memory();
        let mut listener_a = bus.listener("orch:6005", "reply-a").await.unwrap();
        let mut listener_b = bus.listener("orch:6005", "reply-b").await.unwrap();
        let mut sender = bus.sender("w1:11300", "xjob-work").await.unwrap();

        let worker = test_worker(&bus);
        let shutdown = worker.shutdown_token();
        let handle = tokio::spawn(worker.run());

        sender
            .try_put(&task_message("job-1", "tester", "myitem-0", "reply-a"))
            .await
            .unwrap();
        sender
            .try_put(&task_message("job-1", "tester", "myitem-1", "reply-b"))
            .await
            .unwrap();

        assert!(listener_a
            .reserve(Duration::from_secs(5))
            .await
            .unwrap()
            .is_some());
        assert!(listener_b
            .reserve(Duration::from_secs(5))
            .await
            .unwrap()
            .is_some());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_request_id_embeds_job_id() {
        let reqid = request_id("20190701120000000000-0000000000A");
        assert!(reqid.starts_with("20190701120000000000-0000000000A-"));
    }

    #[test]
    fn test_worker_config_requires_addr() {
        let config = XjobConfig {
            beanstalkd_reply_addr: "orch:6005".to_string(),
            beanstalkd_reply_tube: "reply".to_string(),
            beanstalkd_workers_tube: "work".to_string(),
            backend_endpoint: "memory://".to_string(),
            orchestrator_id: None,
            api_listen: "127.0.0.1:8000".to_string(),
            directory_endpoint: None,
            worker_beanstalkd_addr: None,
            refresh_interval_secs: 5,
            claim_interval_secs: 5,
        };
        assert!(matches!(
            WorkerConfig::try_from(&config),
            Err(XjobError::Config(_))
        ));
    }
}
