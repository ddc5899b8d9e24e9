//! # Job Object
//!
//! The in-memory representation of one job: a record plus its module. Owned
//! by the orchestrator task that claimed the job. Every mutation returns the
//! delta to persist; the backend stays the source of truth.

use chrono::Utc;
use rand::RngExt;
use serde::{Deserialize, Serialize};

use crate::bus::messages::ReplyMessage;
use crate::errors::{XjobError, XjobResult};
use crate::modules::{JobModule, ModuleRegistry, TaskStream};
pub mod record;

use record::{
    ErrorsInfo, ItemsInfo, ItemsUpdate, JobMeta, JobMetaUpdate, JobRecord, JobStatus, JobUpdate,
    JsonMap, DEFAULT_ITEMS_MAX_PER_SECOND, MALFORMED_REPLY_CLASS,
};

/// Generate a fresh job id: a 20-digit UTC timestamp (sortable, so ids order
/// by creation time) plus 44 bits of randomness.
pub fn job_id() -> String {
    let now = Utc::now();
    let suffix: u64 = rand::rng().random_range(0..(1u64 << 44));
    format!(
        "{}{:06}-{:011X}",
        now.format("%Y%m%d%H%M%S"),
        now.timestamp_subsec_micros(),
        suffix
    )
}

/// Creation request accepted by the control API; mirrors the record layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub job: CreateJobMeta,
    #[serde(default)]
    pub items: Option<CreateJobItems>,
    #[serde(default)]
    pub options: JsonMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobMeta {
    #[serde(rename = "type")]
    pub job_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateJobItems {
    #[serde(default)]
    pub max_per_second: Option<u32>,
}

/// One job loaded in memory, with its module
pub struct Job {
    record: JobRecord,
    module: Box<dyn JobModule>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.record.job.id)
            .field("type", &self.record.job.job_type)
            .field("status", &self.record.job.status)
            .finish()
    }
}

impl Job {
    /// Construct a brand-new job in `WAITING` state from a creation request.
    pub fn create(registry: &ModuleRegistry, request: CreateJobRequest) -> XjobResult<Self> {
        let mut options = request.options;
        let module = registry.build(&request.job.job_type, &mut options, &JsonMap::new())?;

        let max_per_second = request
            .items
            .and_then(|items| items.max_per_second)
            .unwrap_or(DEFAULT_ITEMS_MAX_PER_SECOND);

        let now = Utc::now().timestamp();
        let record = JobRecord {
            job: JobMeta {
                id: job_id(),
                job_type: request.job.job_type,
                status: JobStatus::Waiting,
                lock: module.lock(),
                orchestrator_id: None,
                sending: true,
                reason: None,
                ctime: now,
                mtime: now,
            },
            items: ItemsInfo {
                max_per_second,
                expected: module.expected(),
                ..Default::default()
            },
            errors: ErrorsInfo::default(),
            options,
            details: JsonMap::new(),
        };

        Ok(Self { record, module })
    }

    /// Rehydrate a job from a persisted record.
    pub fn load(registry: &ModuleRegistry, record: JobRecord) -> XjobResult<Self> {
        if record.job.id.is_empty() {
            return Err(XjobError::bad_options("Missing job ID"));
        }
        let module = registry.module_for(&record)?;
        Ok(Self { record, module })
    }

    pub fn id(&self) -> &str {
        &self.record.job.id
    }

    pub fn job_type(&self) -> &str {
        &self.record.job.job_type
    }

    pub fn status(&self) -> JobStatus {
        self.record.job.status
    }

    pub fn max_per_second(&self) -> u32 {
        self.record.items.max_per_second
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    /// The module's item stream, resuming strictly after `items.last_sent`.
    pub fn tasks(&self) -> TaskStream {
        self.module.tasks(self.record.items.last_sent.clone())
    }

    /// Account one dispatched item and advance the resume cursor.
    pub fn on_sent(&mut self, item: &str) -> JobUpdate {
        self.record.items.sent += 1;
        self.record.items.last_sent = Some(item.to_string());

        JobUpdate {
            items: Some(ItemsUpdate {
                sent: Some(self.record.items.sent),
                last_sent: Some(item.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Mark the item stream exhausted.
    pub fn on_all_sent(&mut self) -> JobUpdate {
        self.record.job.sending = false;

        JobUpdate {
            job: Some(JobMetaUpdate {
                sending: Some(false),
            }),
            ..Default::default()
        }
    }

    /// Reduce one worker reply into the job state.
    ///
    /// An undecodable exception descriptor counts as `MalformedReply`; the
    /// job keeps going either way.
    pub fn on_reply(&mut self, reply: &ReplyMessage) -> JobUpdate {
        self.record.items.processed += 1;

        let mut update = JobUpdate {
            items: Some(ItemsUpdate {
                processed: Some(self.record.items.processed),
                ..Default::default()
            }),
            ..Default::default()
        };

        match &reply.exc {
            Some(exc) if !exc.is_null() => {
                let class_name = exc
                    .get("class_name")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or(MALFORMED_REPLY_CLASS)
                    .to_string();
                tracing::warn!(
                    job_id = %self.record.job.id,
                    job_type = %self.record.job.job_type,
                    error_class = %class_name,
                    "Task failed"
                );
                update.errors = Some(self.record.errors.record(&class_name));
            }
            _ => {
                let result = reply.res.clone().unwrap_or(serde_json::Value::Null);
                if let Some(details) = self.module.reduce_result(&result) {
                    record::merge_json_maps(&mut self.record.details, &details);
                    update.details = Some(details);
                }
            }
        }

        update
    }

    /// Whether every dispatched item has been processed and nothing more
    /// will be sent.
    pub fn is_finished(&self) -> bool {
        if self.record.job.sending {
            return false;
        }
        self.record.items.processed >= self.record.items.sent
    }
}
