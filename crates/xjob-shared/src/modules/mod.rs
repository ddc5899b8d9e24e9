//! # Job Modules
//!
//! A module is the pluggable code behind a job type: it validates options,
//! derives the advisory lock, enumerates the item stream and reduces worker
//! results into job details. The set of modules is closed and compiled in;
//! new job kinds register a factory at startup.

use std::collections::HashMap;
use std::fmt;

use futures::stream::BoxStream;
use serde_json::Value;

use crate::errors::{XjobError, XjobResult};
use crate::job::record::{JobRecord, JsonMap};

pub mod rawx_decommission;
pub mod tester;

/// One work-item descriptor produced by a module.
///
/// `task` is a stable token looked up in the worker-side executor registry;
/// nothing language-specific crosses the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub task: String,
    pub item: String,
    pub kwargs: JsonMap,
}

/// Lazy, resumable sequence of task descriptors
pub type TaskStream = BoxStream<'static, XjobResult<TaskSpec>>;

/// Contract implemented by every job module
pub trait JobModule: Send + Sync {
    /// The registered job type tag
    fn job_type(&self) -> &'static str;

    /// Advisory exclusion key derived from the options, if any
    fn lock(&self) -> Option<String> {
        None
    }

    /// Total number of items the job will produce, when knowable up front
    fn expected(&self) -> Option<u64> {
        None
    }

    /// Enumerate task descriptors in the module's deterministic order.
    ///
    /// With `last_sent = Some(x)` the stream yields only items strictly
    /// after `x`; the cursor lives in the job record, never in the module.
    fn tasks(&self, last_sent: Option<String>) -> TaskStream;

    /// Fold a successful task result into the job details, returning the
    /// patch to persist. Error replies are reduced by the engine itself
    /// into the error histogram.
    fn reduce_result(&mut self, _result: &Value) -> Option<JsonMap> {
        None
    }
}

impl fmt::Debug for dyn JobModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobModule")
            .field("type", &self.job_type())
            .finish()
    }
}

/// Factory constructing a module from (options, details).
///
/// Validation failures surface as `BadOptions`; defaults are written back
/// into the options map so the persisted record is self-describing.
pub type ModuleFactory = fn(&mut JsonMap, &JsonMap) -> XjobResult<Box<dyn JobModule>>;

/// Process-wide immutable mapping from job type to module factory
#[derive(Clone)]
pub struct ModuleRegistry {
    factories: HashMap<&'static str, ModuleFactory>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl ModuleRegistry {
    /// Registry with all built-in modules
    pub fn builtin() -> Self {
        Self {
            factories: HashMap::new(),
        }
        .with_module(tester::TESTER_TYPE, tester::factory)
        .with_module(
            rawx_decommission::RAWX_DECOMMISSION_TYPE,
            rawx_decommission::factory,
        )
    }

    /// Register an additional module factory
    pub fn with_module(mut self, job_type: &'static str, factory: ModuleFactory) -> Self {
        self.factories.insert(job_type, factory);
        self
    }

    /// Registered type tags, sorted
    pub fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Build a module for `job_type`, normalizing `options` in place
    pub fn build(
        &self,
        job_type: &str,
        options: &mut JsonMap,
        details: &JsonMap,
    ) -> XjobResult<Box<dyn JobModule>> {
        let factory = self
            .factories
            .get(job_type)
            .ok_or_else(|| XjobError::UnknownType(job_type.to_string()))?;
        factory(options, details)
    }

    /// Build the module for a loaded record; the persisted options are left
    /// untouched (normalization happens on a copy).
    pub fn module_for(&self, record: &JobRecord) -> XjobResult<Box<dyn JobModule>> {
        let mut options = record.options.clone();
        self.build(&record.job.job_type, &mut options, &record.details)
    }
}

// =============================================================================
// Option parsing helpers
// =============================================================================

/// Read an integer option, tolerating numeric strings; absent or null means
/// `default`.
pub fn opt_u64(options: &JsonMap, key: &str, default: u64) -> XjobResult<u64> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| XjobError::bad_options(format!("{key} must be a non-negative integer"))),
        Some(Value::String(s)) => s
            .parse::<u64>()
            .map_err(|_| XjobError::bad_options(format!("{key} is not a number: {s:?}"))),
        Some(other) => Err(XjobError::bad_options(format!(
            "{key} must be a number, got {other}"
        ))),
    }
}

/// Read a float option, tolerating numeric strings
pub fn opt_f64(options: &JsonMap, key: &str, default: f64) -> XjobResult<f64> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| XjobError::bad_options(format!("{key} must be a number"))),
        Some(Value::String(s)) => s
            .parse::<f64>()
            .map_err(|_| XjobError::bad_options(format!("{key} is not a number: {s:?}"))),
        Some(other) => Err(XjobError::bad_options(format!(
            "{key} must be a number, got {other}"
        ))),
    }
}

/// Read an optional string option
pub fn opt_str(options: &JsonMap, key: &str) -> XjobResult<Option<String>> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(XjobError::bad_options(format!(
            "{key} must be a string, got {other}"
        ))),
    }
}
