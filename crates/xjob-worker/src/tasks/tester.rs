//! # Tester Task
//!
//! Synthetic executor: fails a configurable percentage of items with a
//! typed error drawn from the allowed kinds, succeeds loudly otherwise.

use rand::RngExt;
use serde_json::Value;
use tracing::info;

use xjob_shared::job::record::JsonMap;
use xjob_shared::modules::tester::ERROR_KINDS;

use super::{TaskError, TaskResult};

#[derive(Debug, Default)]
pub struct TesterTask;

impl TesterTask {
    pub fn process(&self, item: &str, kwargs: &JsonMap, reqid: &str) -> TaskResult {
        let error_percentage = kwargs
            .get("error_percentage")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        if error_percentage > 0 {
            let mut rng = rand::rng();
            if rng.random_range(0..100) < error_percentage {
                let kinds: Vec<&str> = match kwargs.get("error_kinds").and_then(Value::as_array) {
                    Some(kinds) => kinds.iter().filter_map(Value::as_str).collect(),
                    None => ERROR_KINDS.to_vec(),
                };
                let class_name = if kinds.is_empty() {
                    "ServiceBusy"
                } else {
                    kinds[rng.random_range(0..kinds.len())]
                };
                return Err(TaskError::new(
                    class_name,
                    format!("synthetic failure on {item}"),
                ));
            }
        }

        info!(item = %item, reqid = %reqid, "It works !!!");
        Ok(Value::Null)
    }
}
