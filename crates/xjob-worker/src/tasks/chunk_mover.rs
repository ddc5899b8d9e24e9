//! # Chunk Mover Task
//!
//! Relocates one chunk away from a rawx service being decommissioned:
//! checks the chunk's size against the job bounds, then asks the service to
//! move it, excluding the configured destination services. Returns the
//! moved size so the module can account total drained bytes.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info};

use xjob_shared::job::record::JsonMap;

use super::{TaskError, TaskResult};

const DEFAULT_RAWX_TIMEOUT: f64 = 60.0;

#[derive(Debug)]
pub struct ChunkMoverTask {
    client: reqwest::Client,
}

impl Default for ChunkMoverTask {
    fn default() -> Self {
        Self::new()
    }
}

fn request_error(err: reqwest::Error) -> TaskError {
    if err.is_timeout() || err.is_connect() {
        TaskError::retriable("ServiceBusy", err.to_string())
    } else {
        TaskError::new("ChunkMoveFailed", err.to_string())
    }
}

impl ChunkMoverTask {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub async fn process(&self, chunk_id: &str, kwargs: &JsonMap, reqid: &str) -> TaskResult {
        let rawx_id = kwargs
            .get("rawx_id")
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::new("ValueError", "No rawx ID"))?;
        let timeout = Duration::from_secs_f64(
            kwargs
                .get("rawx_timeout")
                .and_then(Value::as_f64)
                .unwrap_or(DEFAULT_RAWX_TIMEOUT),
        );
        let min_chunk_size = kwargs
            .get("min_chunk_size")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let max_chunk_size = kwargs
            .get("max_chunk_size")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let excluded_rawx = kwargs
            .get("excluded_rawx")
            .cloned()
            .unwrap_or_else(|| json!([]));

        let chunk_url = format!("http://{rawx_id}/{chunk_id}");
        let head = self
            .client
            .head(&chunk_url)
            .timeout(timeout)
            .header("X-Request-Id", reqid)
            .send()
            .await
            .map_err(request_error)?;

        match head.status().as_u16() {
            404 => return Err(TaskError::new("NotFound", format!("{chunk_url} is gone"))),
            status if status >= 400 => {
                return Err(TaskError::new(
                    "ChunkMoveFailed",
                    format!("HEAD {chunk_url} returned {status}"),
                ))
            }
            _ => {}
        }
        let chunk_size = head
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);

        // Out-of-bounds chunks are skipped, not failed.
        if chunk_size < min_chunk_size {
            debug!(chunk = %chunk_url, size = chunk_size, "SKIP, too small");
            return Ok(Value::Null);
        }
        if max_chunk_size > 0 && chunk_size > max_chunk_size {
            debug!(chunk = %chunk_url, size = chunk_size, "SKIP, too big");
            return Ok(Value::Null);
        }

        let move_response = self
            .client
            .post(format!("{chunk_url}/move"))
            .timeout(timeout)
            .header("X-Request-Id", reqid)
            .json(&json!({ "excluded": excluded_rawx }))
            .send()
            .await
            .map_err(request_error)?;

        match move_response.status().as_u16() {
            404 => Err(TaskError::new("OrphanChunk", "Content not found")),
            503 => Err(TaskError::retriable("ServiceBusy", "rawx is busy")),
            status if status >= 400 => Err(TaskError::new(
                "ChunkMoveFailed",
                format!("move of {chunk_url} returned {status}"),
            )),
            _ => {
                info!(chunk = %chunk_url, size = chunk_size, "Moved chunk");
                Ok(json!(chunk_size))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_rawx_id_is_value_error() {
        let task = ChunkMoverTask::new();
        let err = task
            .process("chunk-1", &JsonMap::new(), "reqid")
            .await
            .unwrap_err();
        assert_eq!(err.class_name, "ValueError");
    }

    #[tokio::test]
    async fn test_unreachable_rawx_is_retriable() {
        let task = ChunkMoverTask::new();
        let kwargs = json!({
            "rawx_id": "127.0.0.1:1",
            "rawx_timeout": 0.2
        })
        .as_object()
        .unwrap()
        .clone();

        let err = task.process("chunk-1", &kwargs, "reqid").await.unwrap_err();
        assert_eq!(err.class_name, "ServiceBusy");
        assert!(err.retriable);
    }
}
