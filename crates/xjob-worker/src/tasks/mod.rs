//! # Task Executors
//!
//! Worker-side counterpart of the module registry: a closed mapping from
//! the task token carried in a bus message to the code that runs it. Every
//! failure is a typed error reduced into the job's error histogram; no
//! executor error ever fails the job itself.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use xjob_shared::bus::messages::ExcInfo;
use xjob_shared::job::record::JsonMap;
use xjob_shared::modules::rawx_decommission::CHUNK_MOVER_TASK;
use xjob_shared::modules::tester::TESTER_TASK;

pub mod chunk_mover;
pub mod tester;

/// Typed failure raised by a task executor
#[derive(Debug, Clone, Error)]
#[error("{class_name}: {message}")]
pub struct TaskError {
    pub class_name: String,
    pub message: String,
    pub retriable: bool,
}

impl TaskError {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
            retriable: false,
        }
    }

    pub fn retriable(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retriable: true,
            ..Self::new(class_name, message)
        }
    }
}

impl From<TaskError> for ExcInfo {
    fn from(err: TaskError) -> Self {
        ExcInfo {
            class_name: err.class_name,
            message: err.message,
            retriable: Some(err.retriable),
        }
    }
}

/// Result of one task execution; `Null` is a valid success
pub type TaskResult = Result<Value, TaskError>;

/// Executor dispatch, one variant per task token
#[derive(Debug)]
pub enum TaskExecutor {
    Tester(tester::TesterTask),
    ChunkMover(chunk_mover::ChunkMoverTask),
}

impl TaskExecutor {
    /// Run the task on one item.
    pub async fn process(&self, item: &str, kwargs: &JsonMap, reqid: &str) -> TaskResult {
        match self {
            Self::Tester(task) => task.process(item, kwargs, reqid),
            Self::ChunkMover(task) => task.process(item, kwargs, reqid).await,
        }
    }
}

/// Compiled-in mapping from task token to executor
#[derive(Debug)]
pub struct TaskRegistry {
    executors: HashMap<&'static str, TaskExecutor>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TaskRegistry {
    /// Registry with all built-in executors
    pub fn builtin() -> Self {
        let mut executors = HashMap::new();
        executors.insert(
            TESTER_TASK,
            TaskExecutor::Tester(tester::TesterTask::default()),
        );
        executors.insert(
            CHUNK_MOVER_TASK,
            TaskExecutor::ChunkMover(chunk_mover::ChunkMoverTask::new()),
        );
        Self { executors }
    }

    /// Look up the executor for a task token.
    pub fn get(&self, token: &str) -> Option<&TaskExecutor> {
        self.executors.get(token)
    }
}
