//! # Job Record
//!
//! Canonical persisted shape of a job and the delta type the in-memory job
//! produces for the backend to merge. The record is grouped in sections
//! (`job`, `items`, `errors`, `options`, `details`) so deltas can patch one
//! section without rewriting the others.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// JSON object alias used for module options and details
pub type JsonMap = serde_json::Map<String, Value>;

/// Default dispatch rate when a job does not set `items.max_per_second`
pub const DEFAULT_ITEMS_MAX_PER_SECOND: u32 = 30;

/// Error class recorded when a reply cannot be decoded
pub const MALFORMED_REPLY_CLASS: &str = "MalformedReply";

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Waiting,
    Running,
    Paused,
    Finished,
    Failed,
}

impl JobStatus {
    /// Whether the job can never run again
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Running => "RUNNING",
            JobStatus::Paused => "PAUSED",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Identity and lifecycle section of a job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMeta {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    /// Advisory exclusion key; at most one RUNNING job per non-empty lock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_id: Option<String>,
    /// True until the module's item stream is exhausted
    pub sending: bool,
    /// Failure reason recorded by `fail`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Creation time, epoch seconds
    pub ctime: i64,
    /// Last modification time, epoch seconds; never decreases
    pub mtime: i64,
}

/// Item progress section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemsInfo {
    pub max_per_second: u32,
    pub sent: u64,
    pub processed: u64,
    /// Resume cursor: the last item successfully dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
}

impl Default for ItemsInfo {
    fn default() -> Self {
        Self {
            max_per_second: DEFAULT_ITEMS_MAX_PER_SECOND,
            sent: 0,
            processed: 0,
            last_sent: None,
            expected: None,
        }
    }
}

/// Error histogram section: a grand total plus one counter per error class
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorsInfo {
    pub total: u64,
    #[serde(flatten)]
    pub per_class: BTreeMap<String, u64>,
}

impl ErrorsInfo {
    /// Count one error of the given class, returning a delta carrying only
    /// the touched counters.
    pub fn record(&mut self, class_name: &str) -> ErrorsInfo {
        self.total += 1;
        let count = self.per_class.entry(class_name.to_string()).or_insert(0);
        *count += 1;

        let mut per_class = BTreeMap::new();
        per_class.insert(class_name.to_string(), *count);
        ErrorsInfo {
            total: self.total,
            per_class,
        }
    }
}

// The Redis backend re-encodes sections through Lua, where cjson encodes an
// empty map as an empty array. Accept both shapes when deserializing.
fn lenient_map<'de, D>(deserializer: D) -> Result<JsonMap, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        Some(Value::Object(map)) => Ok(map),
        Some(Value::Array(items)) if items.is_empty() => Ok(JsonMap::new()),
        None | Some(Value::Null) => Ok(JsonMap::new()),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected an object, got {other}"
        ))),
    }
}

/// The canonical persisted unit: one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: JobMeta,
    #[serde(default)]
    pub items: ItemsInfo,
    #[serde(default)]
    pub errors: ErrorsInfo,
    #[serde(default, deserialize_with = "lenient_map")]
    pub options: JsonMap,
    #[serde(default, deserialize_with = "lenient_map")]
    pub details: JsonMap,
}

impl JobRecord {
    /// Apply a delta in place, bumping `mtime` to `now` (monotonically).
    ///
    /// Deltas never change `status`, `id`, `lock` or the index placement of
    /// the record; those transitions go through dedicated backend operations.
    pub fn apply_update(&mut self, delta: &JobUpdate, now: i64) {
        if let Some(job) = &delta.job {
            if let Some(sending) = job.sending {
                self.job.sending = sending;
            }
        }
        if let Some(items) = &delta.items {
            if let Some(sent) = items.sent {
                self.items.sent = sent;
            }
            if let Some(processed) = items.processed {
                self.items.processed = processed;
            }
            if let Some(last_sent) = &items.last_sent {
                self.items.last_sent = Some(last_sent.clone());
            }
        }
        if let Some(errors) = &delta.errors {
            self.errors.total = errors.total;
            for (class_name, count) in &errors.per_class {
                self.errors.per_class.insert(class_name.clone(), *count);
            }
        }
        if let Some(details) = &delta.details {
            merge_json_maps(&mut self.details, details);
        }
        self.job.mtime = self.job.mtime.max(now);
    }
}

/// Deep-merge `patch` into `target`: nested objects merge, everything else
/// overwrites.
pub fn merge_json_maps(target: &mut JsonMap, patch: &JsonMap) {
    for (key, value) in patch {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_json_maps(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Patch for the `job` section; only `sending` may change through `update`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMetaUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sending: Option<bool>,
}

/// Patch for the `items` section, absolute counter values
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sent: Option<String>,
}

/// Delta produced by the in-memory job and merged by the backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobMetaUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<ItemsUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorsInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonMap>,
}

impl JobUpdate {
    /// Whether the delta patches nothing
    pub fn is_empty(&self) -> bool {
        self.job.is_none() && self.items.is_none() && self.errors.is_none() && self.details.is_none()
    }
}
