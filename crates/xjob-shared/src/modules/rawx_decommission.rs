//! # Rawx Decommission Module
//!
//! Drains a rawx storage service by moving every chunk it hosts somewhere
//! else. Chunk ids come from the rdir directory service, paginated with the
//! chunk id itself as the cursor, which makes the stream resumable for free.
//! Two decommissions of the same service are mutually exclusive through the
//! `rawx/{id}` lock.

use std::collections::VecDeque;
use std::time::Duration;

use futures::stream;
use serde_json::{json, Value};

use crate::errors::{XjobError, XjobResult};
use crate::job::record::JsonMap;
use crate::modules::{opt_f64, opt_str, opt_u64, JobModule, TaskSpec, TaskStream};

pub const RAWX_DECOMMISSION_TYPE: &str = "rawx-decommission";

/// Executor token carried in the bus message
pub const CHUNK_MOVER_TASK: &str = "chunk-mover";

const DEFAULT_RDIR_FETCH_LIMIT: u64 = 1000;
const DEFAULT_RDIR_TIMEOUT: f64 = 60.0;
const DEFAULT_RAWX_TIMEOUT: f64 = 60.0;
const DEFAULT_MIN_CHUNK_SIZE: u64 = 0;
const DEFAULT_MAX_CHUNK_SIZE: u64 = 0;

/// Module factory registered under `rawx-decommission`
pub fn factory(options: &mut JsonMap, details: &JsonMap) -> XjobResult<Box<dyn JobModule>> {
    let rawx_id = opt_str(options, "rawx_id")?
        .filter(|id| !id.is_empty())
        .ok_or_else(|| XjobError::bad_options("Missing rawx ID"))?;
    let rdir_endpoint = opt_str(options, "rdir_endpoint")?
        .filter(|endpoint| !endpoint.is_empty())
        .ok_or_else(|| XjobError::bad_options("Missing rdir endpoint"))?;

    let rdir_fetch_limit = opt_u64(options, "rdir_fetch_limit", DEFAULT_RDIR_FETCH_LIMIT)?;
    if rdir_fetch_limit == 0 {
        return Err(XjobError::bad_options("rdir_fetch_limit must be positive"));
    }
    let rdir_timeout = opt_f64(options, "rdir_timeout", DEFAULT_RDIR_TIMEOUT)?;
    let rawx_timeout = opt_f64(options, "rawx_timeout", DEFAULT_RAWX_TIMEOUT)?;
    if rdir_timeout <= 0.0 || rawx_timeout <= 0.0 {
        return Err(XjobError::bad_options("timeouts must be positive"));
    }
    let min_chunk_size = opt_u64(options, "min_chunk_size", DEFAULT_MIN_CHUNK_SIZE)?;
    let max_chunk_size = opt_u64(options, "max_chunk_size", DEFAULT_MAX_CHUNK_SIZE)?;

    let excluded_rawx: Vec<String> = opt_str(options, "excluded_rawx")?
        .unwrap_or_default()
        .split(',')
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();

    options.insert("rdir_fetch_limit".to_string(), json!(rdir_fetch_limit));
    options.insert("rdir_timeout".to_string(), json!(rdir_timeout));
    options.insert("rawx_timeout".to_string(), json!(rawx_timeout));
    options.insert("min_chunk_size".to_string(), json!(min_chunk_size));
    options.insert("max_chunk_size".to_string(), json!(max_chunk_size));

    let chunks_size = details
        .get("chunks")
        .and_then(|chunks| chunks.get("size"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(Box::new(RawxDecommissionModule {
        rawx_id,
        rdir_endpoint,
        rdir_fetch_limit,
        rdir_timeout,
        rawx_timeout,
        min_chunk_size,
        max_chunk_size,
        excluded_rawx,
        chunks_size,
    }))
}

struct RawxDecommissionModule {
    rawx_id: String,
    rdir_endpoint: String,
    rdir_fetch_limit: u64,
    rdir_timeout: f64,
    rawx_timeout: f64,
    min_chunk_size: u64,
    max_chunk_size: u64,
    excluded_rawx: Vec<String>,
    /// Accumulated size of moved chunks, rehydrated from details
    chunks_size: u64,
}

struct ChunkFetch {
    client: reqwest::Client,
    endpoint: String,
    rawx_id: String,
    limit: u64,
    cursor: Option<String>,
    buffer: VecDeque<String>,
    exhausted: bool,
    kwargs: JsonMap,
}

impl ChunkFetch {
    async fn next_page(&mut self) -> XjobResult<()> {
        let mut request = self
            .client
            .get(format!("{}/v1/rdir/fetch", self.endpoint))
            .query(&[("vol", self.rawx_id.as_str())])
            .query(&[("limit", self.limit)]);
        if let Some(cursor) = &self.cursor {
            request = request.query(&[("start_after", cursor.as_str())]);
        }

        let chunk_ids: Vec<String> = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if (chunk_ids.len() as u64) < self.limit {
            self.exhausted = true;
        }
        if let Some(last) = chunk_ids.last() {
            self.cursor = Some(last.clone());
        }
        self.buffer.extend(chunk_ids);
        Ok(())
    }
}

impl JobModule for RawxDecommissionModule {
    fn job_type(&self) -> &'static str {
        RAWX_DECOMMISSION_TYPE
    }

    fn lock(&self) -> Option<String> {
        Some(format!("rawx/{}", self.rawx_id))
    }

    fn tasks(&self, last_sent: Option<String>) -> TaskStream {
        let mut kwargs = JsonMap::new();
        kwargs.insert("rawx_id".to_string(), json!(self.rawx_id));
        kwargs.insert("rawx_timeout".to_string(), json!(self.rawx_timeout));
        kwargs.insert("min_chunk_size".to_string(), json!(self.min_chunk_size));
        kwargs.insert("max_chunk_size".to_string(), json!(self.max_chunk_size));
        kwargs.insert("excluded_rawx".to_string(), json!(self.excluded_rawx));

        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(self.rdir_timeout))
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                return Box::pin(stream::once(async move { Err(XjobError::from(err)) }));
            }
        };

        let fetch = ChunkFetch {
            client,
            endpoint: self.rdir_endpoint.clone(),
            rawx_id: self.rawx_id.clone(),
            limit: self.rdir_fetch_limit,
            cursor: last_sent,
            buffer: VecDeque::new(),
            exhausted: false,
            kwargs,
        };

        Box::pin(stream::try_unfold(fetch, |mut fetch| async move {
            loop {
                if let Some(chunk_id) = fetch.buffer.pop_front() {
                    let spec = TaskSpec {
                        task: CHUNK_MOVER_TASK.to_string(),
                        item: chunk_id,
                        kwargs: fetch.kwargs.clone(),
                    };
                    return Ok(Some((spec, fetch)));
                }
                if fetch.exhausted {
                    return Ok(None);
                }
                fetch.next_page().await?;
            }
        }))
    }

    fn reduce_result(&mut self, result: &Value) -> Option<JsonMap> {
        // Null result means the chunk was skipped by the size bounds.
        let moved = result.as_u64()?;
        self.chunks_size += moved;

        let mut patch = JsonMap::new();
        patch.insert(
            "chunks".to_string(),
            json!({ "size": self.chunks_size }),
        );
        Some(patch)
    }
}
