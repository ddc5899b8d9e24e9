//! # Redis Backend
//!
//! Job store on Redis. Every compound transition runs as one server-side
//! Lua script, so concurrent orchestrators and the control API never observe
//! a half-applied transition; `claim` in particular pops, re-statuses and
//! takes the advisory lock in a single atomic unit.
//!
//! Layout: `xjob:job:{id}` is a hash of JSON sections (`job`, `items`,
//! `errors`, `options`, `details`); `xjob:jobs` and `xjob:waiting` are
//! score-0 zsets ordered lexically by id (ids are time-prefixed, so lex
//! order is creation order); `xjob:orch:{oid}` holds the assignment set and
//! `xjob:locks` maps lock key to holding job id. Scripts build job keys
//! from a prefix argument: single-instance Redis, not cluster.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::Value;

use crate::errors::{XjobError, XjobResult};
use crate::job::record::{ErrorsInfo, ItemsInfo, JobMeta, JobRecord, JobStatus, JobUpdate, JsonMap};

const JOBS_KEY: &str = "xjob:jobs";
const WAITING_KEY: &str = "xjob:waiting";
const LOCKS_KEY: &str = "xjob:locks";
const JOB_KEY_PREFIX: &str = "xjob:job:";
const ORCH_KEY_PREFIX: &str = "xjob:orch:";

fn job_key(id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{id}")
}

fn orch_key(orchestrator_id: &str) -> String {
    format!("{ORCH_KEY_PREFIX}{orchestrator_id}")
}

// Shared by every script that patches the `job` section.
const LUA_HELPERS: &str = r#"
local function merge(dst, src)
  for k, v in pairs(src) do
    if type(v) == 'table' and type(dst[k]) == 'table' then
      merge(dst[k], v)
    else
      dst[k] = v
    end
  end
end

local function bump_mtime(job, now)
  if now > (tonumber(job.mtime) or 0) then
    job.mtime = now
  end
end

local function job_lock(job)
  local lock = job.lock
  if lock == cjson.null or lock == '' then
    return nil
  end
  return lock
end

local function release_lock(locks_key, job, id)
  local lock = job_lock(job)
  if lock ~= nil and redis.call('HGET', locks_key, lock) == id then
    redis.call('HDEL', locks_key, lock)
  end
end
"#;

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 'CONFLICT'
end
redis.call('HSET', KEYS[1],
  'job', ARGV[2], 'items', ARGV[3], 'errors', ARGV[4],
  'options', ARGV[5], 'details', ARGV[6])
redis.call('ZADD', KEYS[2], 0, ARGV[1])
redis.call('ZADD', KEYS[3], 0, ARGV[1])
return 'OK'
"#;

const UPDATE_SCRIPT: &str = r#"
local job_raw = redis.call('HGET', KEYS[1], 'job')
if not job_raw then
  return 'NOT_FOUND'
end
local job = cjson.decode(job_raw)
local delta = cjson.decode(ARGV[1])

if delta.job and delta.job.sending ~= nil then
  job.sending = delta.job.sending
end
for _, section in ipairs({'items', 'errors', 'details'}) do
  if delta[section] ~= nil then
    local raw = redis.call('HGET', KEYS[1], section)
    local current = {}
    if raw then
      current = cjson.decode(raw)
      if type(current) ~= 'table' then current = {} end
    end
    merge(current, delta[section])
    redis.call('HSET', KEYS[1], section, cjson.encode(current))
  end
end
bump_mtime(job, tonumber(ARGV[2]))
redis.call('HSET', KEYS[1], 'job', cjson.encode(job))
return redis.call('HGETALL', KEYS[1])
"#;

const CLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYLEX', KEYS[1], '-', '+')
for _, id in ipairs(ids) do
  local key = ARGV[3] .. id
  local job_raw = redis.call('HGET', key, 'job')
  if job_raw then
    local job = cjson.decode(job_raw)
    local lock = job_lock(job)
    if lock == nil or redis.call('HEXISTS', KEYS[2], lock) == 0 then
      job.status = 'RUNNING'
      job.orchestrator_id = ARGV[1]
      bump_mtime(job, tonumber(ARGV[2]))
      redis.call('HSET', key, 'job', cjson.encode(job))
      redis.call('ZREM', KEYS[1], id)
      redis.call('SADD', KEYS[3], id)
      if lock ~= nil then
        redis.call('HSET', KEYS[2], lock, id)
      end
      return redis.call('HGETALL', key)
    end
  end
end
return false
"#;

const PAUSE_SCRIPT: &str = r#"
local job_raw = redis.call('HGET', KEYS[1], 'job')
if not job_raw then
  return 'NOT_FOUND'
end
local job = cjson.decode(job_raw)
if job.status ~= 'RUNNING' then
  return 'BAD_STATE:' .. job.status
end
job.status = 'PAUSED'
bump_mtime(job, tonumber(ARGV[2]))
redis.call('HSET', KEYS[1], 'job', cjson.encode(job))
release_lock(KEYS[2], job, ARGV[1])
return 'OK'
"#;

const RESUME_SCRIPT: &str = r#"
local job_raw = redis.call('HGET', KEYS[1], 'job')
if not job_raw then
  return 'NOT_FOUND'
end
local job = cjson.decode(job_raw)
if job.status ~= 'PAUSED' then
  return 'BAD_STATE:' .. job.status
end
local oid = job.orchestrator_id
if oid ~= cjson.null and oid ~= nil and oid ~= '' then
  redis.call('SREM', ARGV[3] .. oid, ARGV[1])
end
job.orchestrator_id = nil
job.status = 'WAITING'
bump_mtime(job, tonumber(ARGV[2]))
redis.call('HSET', KEYS[1], 'job', cjson.encode(job))
redis.call('ZADD', KEYS[2], 0, ARGV[1])
return 'OK'
"#;

const FINISH_SCRIPT: &str = r#"
local job_raw = redis.call('HGET', KEYS[1], 'job')
if not job_raw then
  return 'NOT_FOUND'
end
local job = cjson.decode(job_raw)
if job.status ~= 'RUNNING' then
  return 'BAD_STATE:' .. job.status
end
local oid = job.orchestrator_id
if oid ~= cjson.null and oid ~= nil and oid ~= '' then
  redis.call('SREM', ARGV[3] .. oid, ARGV[1])
end
release_lock(KEYS[2], job, ARGV[1])
job.orchestrator_id = nil
job.status = 'FINISHED'
bump_mtime(job, tonumber(ARGV[2]))
redis.call('HSET', KEYS[1], 'job', cjson.encode(job))
return 'OK'
"#;

const FAIL_SCRIPT: &str = r#"
local job_raw = redis.call('HGET', KEYS[1], 'job')
if not job_raw then
  return 'NOT_FOUND'
end
local job = cjson.decode(job_raw)
if job.status == 'RUNNING' then
  local oid = job.orchestrator_id
  if oid ~= cjson.null and oid ~= nil and oid ~= '' then
    redis.call('SREM', ARGV[4] .. oid, ARGV[1])
  end
  release_lock(KEYS[2], job, ARGV[1])
  job.orchestrator_id = nil
elseif job.status == 'WAITING' then
  redis.call('ZREM', KEYS[3], ARGV[1])
else
  return 'BAD_STATE:' .. job.status
end
job.status = 'FAILED'
if ARGV[3] ~= '' then
  job.reason = ARGV[3]
end
bump_mtime(job, tonumber(ARGV[2]))
redis.call('HSET', KEYS[1], 'job', cjson.encode(job))
return 'OK'
"#;

const DELETE_SCRIPT: &str = r#"
local job_raw = redis.call('HGET', KEYS[1], 'job')
if not job_raw then
  return 'NOT_FOUND'
end
local job = cjson.decode(job_raw)
if job.status == 'RUNNING' then
  return 'BAD_STATE:' .. job.status
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
local oid = job.orchestrator_id
if oid ~= cjson.null and oid ~= nil and oid ~= '' then
  redis.call('SREM', ARGV[2] .. oid, ARGV[1])
end
release_lock(KEYS[4], job, ARGV[1])
redis.call('DEL', KEYS[1])
return 'OK'
"#;

struct Scripts {
    create: Script,
    update: Script,
    claim: Script,
    pause: Script,
    resume: Script,
    finish: Script,
    fail: Script,
    delete: Script,
}

impl Scripts {
    fn new() -> Self {
        let with_helpers = |body: &str| Script::new(&format!("{LUA_HELPERS}\n{body}"));
        Self {
            create: Script::new(CREATE_SCRIPT),
            update: with_helpers(UPDATE_SCRIPT),
            claim: with_helpers(CLAIM_SCRIPT),
            pause: with_helpers(PAUSE_SCRIPT),
            resume: with_helpers(RESUME_SCRIPT),
            finish: with_helpers(FINISH_SCRIPT),
            fail: with_helpers(FAIL_SCRIPT),
            delete: with_helpers(DELETE_SCRIPT),
        }
    }
}

/// Job store backed by a single Redis instance
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    scripts: std::sync::Arc<Scripts>,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to `redis://...`.
    pub async fn connect(endpoint: &str) -> XjobResult<Self> {
        let client = redis::Client::open(endpoint)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            scripts: std::sync::Arc::new(Scripts::new()),
        })
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    fn record_sections(record: &JobRecord) -> XjobResult<[String; 5]> {
        Ok([
            serde_json::to_string(&record.job)?,
            serde_json::to_string(&record.items)?,
            serde_json::to_string(&record.errors)?,
            serde_json::to_string(&record.options)?,
            serde_json::to_string(&record.details)?,
        ])
    }

    // cjson encodes empty maps as empty arrays; be lenient on the way back.
    fn parse_map_section(raw: Option<&String>) -> XjobResult<JsonMap> {
        let Some(raw) = raw else {
            return Ok(JsonMap::new());
        };
        match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => Ok(map),
            Value::Array(items) if items.is_empty() => Ok(JsonMap::new()),
            Value::Null => Ok(JsonMap::new()),
            other => Err(XjobError::backend(format!(
                "malformed record section: {other}"
            ))),
        }
    }

    fn record_from_sections(sections: &HashMap<String, String>) -> XjobResult<JobRecord> {
        let job_raw = sections
            .get("job")
            .ok_or_else(|| XjobError::backend("record is missing its job section"))?;
        let job: JobMeta = serde_json::from_str(job_raw)?;
        let items: ItemsInfo = match sections.get("items") {
            Some(raw) => serde_json::from_str(raw)?,
            None => ItemsInfo::default(),
        };
        let errors: ErrorsInfo = match sections.get("errors") {
            Some(raw) => serde_json::from_str(raw)?,
            None => ErrorsInfo::default(),
        };

        Ok(JobRecord {
            job,
            items,
            errors,
            options: Self::parse_map_section(sections.get("options"))?,
            details: Self::parse_map_section(sections.get("details"))?,
        })
    }

    fn value_to_string(value: &redis::Value) -> Option<String> {
        match value {
            redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            redis::Value::SimpleString(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn record_from_value(value: redis::Value) -> XjobResult<JobRecord> {
        let redis::Value::Array(entries) = value else {
            return Err(XjobError::backend("expected a record array from script"));
        };
        let mut sections = HashMap::with_capacity(entries.len() / 2);
        let mut entries = entries.into_iter();
        while let (Some(field), Some(value)) = (entries.next(), entries.next()) {
            let (Some(field), Some(value)) = (
                Self::value_to_string(&field),
                Self::value_to_string(&value),
            ) else {
                return Err(XjobError::backend("non-string record section from script"));
            };
            sections.insert(field, value);
        }
        Self::record_from_sections(&sections)
    }

    /// Map a script status reply onto the error taxonomy.
    fn check_status(op: &str, id: &str, value: &redis::Value) -> XjobResult<()> {
        let Some(status) = Self::value_to_string(value) else {
            return Err(XjobError::backend(format!(
                "unexpected {op} reply: {value:?}"
            )));
        };
        match status.as_str() {
            "OK" => Ok(()),
            "CONFLICT" => Err(XjobError::Conflict(id.to_string())),
            "NOT_FOUND" => Err(XjobError::NotFound(id.to_string())),
            other => match other.strip_prefix("BAD_STATE:") {
                Some(status) => Err(XjobError::bad_state(format!(
                    "cannot {op} a {status} job"
                ))),
                None => Err(XjobError::backend(format!(
                    "unexpected {op} reply: {other}"
                ))),
            },
        }
    }

    pub async fn create(&self, record: &JobRecord) -> XjobResult<()> {
        let mut record = record.clone();
        record.job.status = JobStatus::Waiting;
        let id = record.job.id.clone();
        let [job, items, errors, options, details] = Self::record_sections(&record)?;

        let mut conn = self.conn.clone();
        let reply: redis::Value = self
            .scripts
            .create
            .key(job_key(&id))
            .key(JOBS_KEY)
            .key(WAITING_KEY)
            .arg(&id)
            .arg(job)
            .arg(items)
            .arg(errors)
            .arg(options)
            .arg(details)
            .invoke_async(&mut conn)
            .await?;
        Self::check_status("create", &id, &reply)
    }

    async fn fetch(&self, id: &str) -> XjobResult<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let sections: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(job_key(id))
            .query_async(&mut conn)
            .await?;
        if sections.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::record_from_sections(&sections)?))
    }

    async fn fetch_many(&self, ids: &[String]) -> XjobResult<Vec<JobRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            // A record may have been deleted between the index scan and the
            // fetch; just skip it.
            if let Some(record) = self.fetch(id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub async fn list(&self, limit: usize, marker: Option<&str>) -> XjobResult<Vec<JobRecord>> {
        let lower = match marker {
            Some(marker) => format!("({marker}"),
            None => "-".to_string(),
        };
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYLEX")
            .arg(JOBS_KEY)
            .arg(lower)
            .arg("+")
            .arg("LIMIT")
            .arg(0)
            .arg(limit as i64)
            .query_async(&mut conn)
            .await?;
        self.fetch_many(&ids).await
    }

    pub async fn list_waiting(&self) -> XjobResult<Vec<JobRecord>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYLEX")
            .arg(WAITING_KEY)
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await?;
        self.fetch_many(&ids).await
    }

    pub async fn list_orchestrator(&self, orchestrator_id: &str) -> XjobResult<Vec<JobRecord>> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(orch_key(orchestrator_id))
            .query_async(&mut conn)
            .await?;
        ids.sort_unstable();
        self.fetch_many(&ids).await
    }

    pub async fn get(&self, id: &str) -> XjobResult<JobRecord> {
        self.fetch(id)
            .await?
            .ok_or_else(|| XjobError::NotFound(id.to_string()))
    }

    pub async fn update(&self, id: &str, delta: &JobUpdate) -> XjobResult<JobRecord> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = self
            .scripts
            .update
            .key(job_key(id))
            .arg(serde_json::to_string(delta)?)
            .arg(Self::now())
            .invoke_async(&mut conn)
            .await?;
        match reply {
            redis::Value::Array(_) => Self::record_from_value(reply),
            other => {
                Self::check_status("update", id, &other)?;
                Err(XjobError::backend("update returned no record"))
            }
        }
    }

    pub async fn claim(&self, orchestrator_id: &str) -> XjobResult<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = self
            .scripts
            .claim
            .key(WAITING_KEY)
            .key(LOCKS_KEY)
            .key(orch_key(orchestrator_id))
            .arg(orchestrator_id)
            .arg(Self::now())
            .arg(JOB_KEY_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        match reply {
            redis::Value::Nil => Ok(None),
            redis::Value::Array(_) => Ok(Some(Self::record_from_value(reply)?)),
            other => Err(XjobError::backend(format!(
                "unexpected claim reply: {other:?}"
            ))),
        }
    }

    pub async fn pause(&self, id: &str) -> XjobResult<()> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = self
            .scripts
            .pause
            .key(job_key(id))
            .key(LOCKS_KEY)
            .arg(id)
            .arg(Self::now())
            .invoke_async(&mut conn)
            .await?;
        Self::check_status("pause", id, &reply)
    }

    pub async fn resume(&self, id: &str) -> XjobResult<()> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = self
            .scripts
            .resume
            .key(job_key(id))
            .key(WAITING_KEY)
            .arg(id)
            .arg(Self::now())
            .arg(ORCH_KEY_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        Self::check_status("resume", id, &reply)
    }

    pub async fn finish(&self, id: &str) -> XjobResult<()> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = self
            .scripts
            .finish
            .key(job_key(id))
            .key(LOCKS_KEY)
            .arg(id)
            .arg(Self::now())
            .arg(ORCH_KEY_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        Self::check_status("finish", id, &reply)
    }

    pub async fn fail(&self, id: &str, reason: Option<&str>) -> XjobResult<()> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = self
            .scripts
            .fail
            .key(job_key(id))
            .key(LOCKS_KEY)
            .key(WAITING_KEY)
            .arg(id)
            .arg(Self::now())
            .arg(reason.unwrap_or(""))
            .arg(ORCH_KEY_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        Self::check_status("fail", id, &reply)
    }

    pub async fn delete(&self, id: &str) -> XjobResult<()> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = self
            .scripts
            .delete
            .key(job_key(id))
            .key(JOBS_KEY)
            .key(WAITING_KEY)
            .key(LOCKS_KEY)
            .arg(id)
            .arg(ORCH_KEY_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        Self::check_status("delete", id, &reply)
    }

    pub async fn locks(&self) -> XjobResult<BTreeMap<String, String>> {
        let mut conn = self.conn.clone();
        let locks: BTreeMap<String, String> = redis::cmd("HGETALL")
            .arg(LOCKS_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(locks)
    }
}
