//! # Tester Module
//!
//! Synthetic job used to exercise the whole dispatch path: a fixed list of
//! 1000 items, with workers raising a configurable percentage of typed
//! errors.

use futures::stream;
use serde_json::{json, Value};

use crate::errors::{XjobError, XjobResult};
use crate::job::record::JsonMap;
use crate::modules::{opt_str, opt_u64, JobModule, TaskSpec, TaskStream};

pub const TESTER_TYPE: &str = "tester";

/// Executor token carried in the bus message
pub const TESTER_TASK: &str = "tester";

/// Error classes a tester worker is allowed to raise
pub const ERROR_KINDS: &[&str] = &[
    "BadRequest",
    "Forbidden",
    "NotFound",
    "MethodNotAllowed",
    "Conflict",
    "PreconditionFailed",
    "TooLarge",
    "UnsatisfiableRange",
    "ServiceBusy",
];

const ITEM_COUNT: usize = 1000;
const DEFAULT_ERROR_PERCENTAGE: u64 = 0;

fn item_name(index: usize) -> String {
    format!("myitem-{index}")
}

/// Module factory registered under `tester`
pub fn factory(options: &mut JsonMap, _details: &JsonMap) -> XjobResult<Box<dyn JobModule>> {
    let error_percentage = opt_u64(options, "error_percentage", DEFAULT_ERROR_PERCENTAGE)?;
    if error_percentage > 100 {
        return Err(XjobError::bad_options(format!(
            "error_percentage must be between 0 and 100, got {error_percentage}"
        )));
    }
    options.insert("error_percentage".to_string(), json!(error_percentage));

    let lock = opt_str(options, "lock")?;

    let error_kinds = match options.get("error_kinds") {
        None | Some(Value::Null) => ERROR_KINDS.iter().map(|s| s.to_string()).collect(),
        Some(Value::Array(kinds)) => {
            let mut parsed = Vec::with_capacity(kinds.len());
            for kind in kinds {
                let Some(kind) = kind.as_str() else {
                    return Err(XjobError::bad_options(format!(
                        "error_kinds entries must be strings, got {kind}"
                    )));
                };
                if !ERROR_KINDS.contains(&kind) {
                    return Err(XjobError::bad_options(format!(
                        "unknown error kind {kind:?}"
                    )));
                }
                parsed.push(kind.to_string());
            }
            parsed
        }
        Some(other) => {
            return Err(XjobError::bad_options(format!(
                "error_kinds must be a list, got {other}"
            )))
        }
    };

    Ok(Box::new(TesterModule {
        lock,
        error_percentage,
        error_kinds,
    }))
}

struct TesterModule {
    lock: Option<String>,
    error_percentage: u64,
    error_kinds: Vec<String>,
}

impl JobModule for TesterModule {
    fn job_type(&self) -> &'static str {
        TESTER_TYPE
    }

    fn lock(&self) -> Option<String> {
        self.lock.clone()
    }

    fn expected(&self) -> Option<u64> {
        Some(ITEM_COUNT as u64)
    }

    fn tasks(&self, last_sent: Option<String>) -> TaskStream {
        let start_index = match &last_sent {
            None => 0,
            Some(item) => {
                match (0..ITEM_COUNT).find(|index| item_name(*index) == *item) {
                    Some(index) => index + 1,
                    None => {
                        let item = item.clone();
                        return Box::pin(stream::once(async move {
                            Err(XjobError::dispatch_failed(format!(
                                "unknown resume cursor {item:?}"
                            )))
                        }));
                    }
                }
            }
        };

        let mut kwargs = JsonMap::new();
        kwargs.insert("error_percentage".to_string(), json!(self.error_percentage));
        kwargs.insert("error_kinds".to_string(), json!(self.error_kinds));
        if let Some(lock) = &self.lock {
            kwargs.insert("lock".to_string(), json!(lock));
        }

        Box::pin(stream::iter((start_index..ITEM_COUNT).map(move |index| {
            Ok(TaskSpec {
                task: TESTER_TASK.to_string(),
                item: item_name(index),
                kwargs: kwargs.clone(),
            })
        })))
    }
}
