//! # Persistent Backend
//!
//! Durable, multi-writer store of job records, the waiting queue, the
//! per-orchestrator assignment sets and the advisory locks. Enum dispatch
//! over two implementations: Redis for production, an in-process store for
//! tests and development. All state transitions are atomic and checked; an
//! illegal transition comes back as `BadState`.

use std::collections::BTreeMap;
use std::sync::Arc;

pub mod memory;
pub mod redis;

use self::memory::MemoryBackend;
use self::redis::RedisBackend;

use crate::errors::{XjobError, XjobResult};
use crate::job::record::{JobRecord, JobUpdate};

/// Job store selector
#[derive(Debug, Clone)]
pub enum JobBackend {
    Memory(Arc<MemoryBackend>),
    Redis(RedisBackend),
}

impl JobBackend {
    /// Create an in-process backend.
    pub fn new_in_memory() -> Self {
        Self::Memory(Arc::new(MemoryBackend::new()))
    }

    /// Connect to the endpoint from the configuration: `memory://` or
    /// `redis://...`.
    pub async fn from_endpoint(endpoint: &str) -> XjobResult<Self> {
        if endpoint.starts_with("memory://") {
            return Ok(Self::new_in_memory());
        }
        if endpoint.starts_with("redis://") || endpoint.starts_with("rediss://") {
            return Ok(Self::Redis(RedisBackend::connect(endpoint).await?));
        }
        Err(XjobError::Config(format!(
            "unsupported backend endpoint {endpoint:?}"
        )))
    }

    /// Backend name for logging
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Redis(_) => "redis",
        }
    }

    /// Insert a fresh record in `WAITING` state. Fails `Conflict` on id
    /// collision.
    pub async fn create(&self, record: &JobRecord) -> XjobResult<()> {
        match self {
            Self::Memory(backend) => backend.create(record),
            Self::Redis(backend) => backend.create(record).await,
        }
    }

    /// Paginated scan of all jobs, ordered by id, strictly after `marker`.
    pub async fn list(&self, limit: usize, marker: Option<&str>) -> XjobResult<Vec<JobRecord>> {
        match self {
            Self::Memory(backend) => backend.list(limit, marker),
            Self::Redis(backend) => backend.list(limit, marker).await,
        }
    }

    /// All waiting jobs in queue (id) order.
    pub async fn list_waiting(&self) -> XjobResult<Vec<JobRecord>> {
        match self {
            Self::Memory(backend) => backend.list_waiting(),
            Self::Redis(backend) => backend.list_waiting().await,
        }
    }

    /// Jobs currently assigned to one orchestrator.
    pub async fn list_orchestrator(&self, orchestrator_id: &str) -> XjobResult<Vec<JobRecord>> {
        match self {
            Self::Memory(backend) => backend.list_orchestrator(orchestrator_id),
            Self::Redis(backend) => backend.list_orchestrator(orchestrator_id).await,
        }
    }

    pub async fn get(&self, id: &str) -> XjobResult<JobRecord> {
        match self {
            Self::Memory(backend) => backend.get(id),
            Self::Redis(backend) => backend.get(id).await,
        }
    }

    /// Merge a progress delta into a record, bump `mtime`, and return the
    /// post-merge record. Never changes `status`, `id`, or index placement.
    pub async fn update(&self, id: &str, delta: &JobUpdate) -> XjobResult<JobRecord> {
        match self {
            Self::Memory(backend) => backend.update(id, delta),
            Self::Redis(backend) => backend.update(id, delta).await,
        }
    }

    /// Atomically pop the first waiting job whose lock is free, mark it
    /// `RUNNING` under `orchestrator_id`, and take its lock.
    pub async fn claim(&self, orchestrator_id: &str) -> XjobResult<Option<JobRecord>> {
        match self {
            Self::Memory(backend) => backend.claim(orchestrator_id),
            Self::Redis(backend) => backend.claim(orchestrator_id).await,
        }
    }

    /// `RUNNING` -> `PAUSED`; releases the lock, keeps the assignment.
    pub async fn pause(&self, id: &str) -> XjobResult<()> {
        match self {
            Self::Memory(backend) => backend.pause(id),
            Self::Redis(backend) => backend.pause(id).await,
        }
    }

    /// `PAUSED` -> `WAITING`; clears the assignment, requeues the job.
    pub async fn resume(&self, id: &str) -> XjobResult<()> {
        match self {
            Self::Memory(backend) => backend.resume(id),
            Self::Redis(backend) => backend.resume(id).await,
        }
    }

    /// `RUNNING` -> `FINISHED`; releases the lock and the assignment.
    pub async fn finish(&self, id: &str) -> XjobResult<()> {
        match self {
            Self::Memory(backend) => backend.finish(id),
            Self::Redis(backend) => backend.finish(id).await,
        }
    }

    /// `RUNNING | WAITING` -> `FAILED`, recording an optional reason.
    pub async fn fail(&self, id: &str, reason: Option<&str>) -> XjobResult<()> {
        match self {
            Self::Memory(backend) => backend.fail(id, reason),
            Self::Redis(backend) => backend.fail(id, reason).await,
        }
    }

    /// Remove a record and all its index entries. Forbidden while `RUNNING`.
    pub async fn delete(&self, id: &str) -> XjobResult<()> {
        match self {
            Self::Memory(backend) => backend.delete(id),
            Self::Redis(backend) => backend.delete(id).await,
        }
    }

    /// Current advisory locks: lock key -> holding job id.
    pub async fn locks(&self) -> XjobResult<BTreeMap<String, String>> {
        match self {
            Self::Memory(backend) => backend.locks(),
            Self::Redis(backend) => backend.locks().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::record::{
        ErrorsInfo, ItemsInfo, ItemsUpdate, JobMeta, JobStatus, JsonMap,
    };
    use crate::job::{job_id, CreateJobItems, CreateJobMeta, CreateJobRequest, Job};
    use crate::modules::ModuleRegistry;

    fn tester_record(lock: Option<&str>) -> JobRecord {
        let mut record = JobRecord {
            job: JobMeta {
                id: job_id(),
                job_type: "tester".to_string(),
                status: JobStatus::Waiting,
                lock: lock.map(str::to_string),
                orchestrator_id: None,
                sending: true,
                reason: None,
                ctime: 1000,
                mtime: 1000,
            },
            items: ItemsInfo::default(),
            errors: ErrorsInfo::default(),
            options: JsonMap::new(),
            details: JsonMap::new(),
        };
        record.items.expected = Some(1000);
        record
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let backend = JobBackend::new_in_memory();
        let record = tester_record(None);
        backend.create(&record).await.unwrap();

        let fetched = backend.get(&record.job.id).await.unwrap();
        assert_eq!(fetched.job.status, JobStatus::Waiting);
        assert_eq!(fetched.items.expected, Some(1000));
    }

    #[tokio::test]
    async fn test_create_conflict_on_same_id() {
        let backend = JobBackend::new_in_memory();
        let record = tester_record(None);
        backend.create(&record).await.unwrap();
        assert!(matches!(
            backend.create(&record).await,
            Err(XjobError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let backend = JobBackend::new_in_memory();
        assert!(matches!(
            backend.get("nope").await,
            Err(XjobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_pagination_in_id_order() {
        let backend = JobBackend::new_in_memory();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let record = tester_record(None);
            ids.push(record.job.id.clone());
            backend.create(&record).await.unwrap();
        }
        ids.sort();

        let first_page = backend.list(3, None).await.unwrap();
        let listed: Vec<_> = first_page.iter().map(|r| r.job.id.clone()).collect();
        assert_eq!(listed, ids[..3].to_vec());

        let second_page = backend.list(3, Some(&ids[2])).await.unwrap();
        let listed: Vec<_> = second_page.iter().map(|r| r.job.id.clone()).collect();
        assert_eq!(listed, ids[3..].to_vec());
    }

    #[tokio::test]
    async fn test_claim_pops_fifo_and_sets_running() {
        let backend = JobBackend::new_in_memory();
        let first = tester_record(None);
        let second = tester_record(None);
        backend.create(&first).await.unwrap();
        backend.create(&second).await.unwrap();

        let claimed = backend.claim("orch-1").await.unwrap().unwrap();
        let (older, _) = if first.job.id < second.job.id {
            (&first, &second)
        } else {
            (&second, &first)
        };
        assert_eq!(claimed.job.id, older.job.id);
        assert_eq!(claimed.job.status, JobStatus::Running);
        assert_eq!(claimed.job.orchestrator_id.as_deref(), Some("orch-1"));

        let assigned = backend.list_orchestrator("orch-1").await.unwrap();
        assert_eq!(assigned.len(), 1);
        let waiting = backend.list_waiting().await.unwrap();
        assert_eq!(waiting.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_skips_held_locks() {
        let backend = JobBackend::new_in_memory();
        let first = tester_record(Some("rawx/1"));
        let second = tester_record(Some("rawx/1"));
        let third = tester_record(Some("rawx/2"));
        backend.create(&first).await.unwrap();
        backend.create(&second).await.unwrap();
        backend.create(&third).await.unwrap();

        let one = backend.claim("orch-1").await.unwrap().unwrap();
        let two = backend.claim("orch-1").await.unwrap().unwrap();
        // The conflicting job is skipped but left in the queue.
        assert_eq!(two.job.lock.as_deref(), Some("rawx/2"));

        assert!(backend.claim("orch-1").await.unwrap().is_none());
        let waiting = backend.list_waiting().await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].job.lock.as_deref(), Some("rawx/1"));

        let locks = backend.locks().await.unwrap();
        assert_eq!(locks.len(), 2);
        assert_eq!(locks["rawx/1"], one.job.id);

        // Once the holder finishes, the conflicting job becomes claimable.
        backend.finish(&one.job.id).await.unwrap();
        let resumed = backend.claim("orch-1").await.unwrap().unwrap();
        assert_eq!(resumed.job.lock.as_deref(), Some("rawx/1"));
    }

    #[tokio::test]
    async fn test_update_merges_and_bumps_mtime() {
        let backend = JobBackend::new_in_memory();
        let record = tester_record(None);
        backend.create(&record).await.unwrap();

        let delta = JobUpdate {
            items: Some(ItemsUpdate {
                sent: Some(3),
                last_sent: Some("myitem-2".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let updated = backend.update(&record.job.id, &delta).await.unwrap();

        assert_eq!(updated.items.sent, 3);
        assert_eq!(updated.items.last_sent.as_deref(), Some("myitem-2"));
        assert!(updated.job.mtime >= record.job.mtime);
        // Status and indices are untouched by update.
        assert_eq!(updated.job.status, JobStatus::Waiting);
        assert_eq!(backend.list_waiting().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_monotone_counters() {
        let backend = JobBackend::new_in_memory();
        let record = tester_record(None);
        backend.create(&record).await.unwrap();

        let mut previous = (0, 0, 0, record.job.mtime);
        for sent in 1..=10u64 {
            let delta = JobUpdate {
                items: Some(ItemsUpdate {
                    sent: Some(sent),
                    processed: Some(sent / 2),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let updated = backend.update(&record.job.id, &delta).await.unwrap();
            let current = (
                updated.items.sent,
                updated.items.processed,
                updated.errors.total,
                updated.job.mtime,
            );
            assert!(current.0 >= previous.0);
            assert!(current.1 >= previous.1);
            assert!(current.2 >= previous.2);
            assert!(current.3 >= previous.3);
            previous = current;
        }
    }

    #[tokio::test]
    async fn test_pause_requires_running_and_releases_lock() {
        let backend = JobBackend::new_in_memory();
        let record = tester_record(Some("rawx/1"));
        backend.create(&record).await.unwrap();

        assert!(matches!(
            backend.pause(&record.job.id).await,
            Err(XjobError::BadState(_))
        ));

        backend.claim("orch-1").await.unwrap().unwrap();
        backend.pause(&record.job.id).await.unwrap();

        let paused = backend.get(&record.job.id).await.unwrap();
        assert_eq!(paused.job.status, JobStatus::Paused);
        // The lock is released, the assignment retained.
        assert!(backend.locks().await.unwrap().is_empty());
        assert_eq!(paused.job.orchestrator_id.as_deref(), Some("orch-1"));
        assert_eq!(backend.list_orchestrator("orch-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_returns_to_waiting() {
        let backend = JobBackend::new_in_memory();
        let record = tester_record(None);
        backend.create(&record).await.unwrap();
        backend.claim("orch-1").await.unwrap().unwrap();
        backend.pause(&record.job.id).await.unwrap();

        backend.resume(&record.job.id).await.unwrap();
        let resumed = backend.get(&record.job.id).await.unwrap();
        assert_eq!(resumed.job.status, JobStatus::Waiting);
        assert!(resumed.job.orchestrator_id.is_none());
        assert_eq!(backend.list_orchestrator("orch-1").await.unwrap().len(), 0);
        assert_eq!(backend.list_waiting().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_requires_paused() {
        let backend = JobBackend::new_in_memory();
        let record = tester_record(None);
        backend.create(&record).await.unwrap();
        assert!(matches!(
            backend.resume(&record.job.id).await,
            Err(XjobError::BadState(_))
        ));
    }

    #[tokio::test]
    async fn test_finish_clears_assignment_and_lock() {
        let backend = JobBackend::new_in_memory();
        let record = tester_record(Some("rawx/9"));
        backend.create(&record).await.unwrap();
        backend.claim("orch-1").await.unwrap().unwrap();

        backend.finish(&record.job.id).await.unwrap();
        let finished = backend.get(&record.job.id).await.unwrap();
        assert_eq!(finished.job.status, JobStatus::Finished);
        assert!(finished.job.orchestrator_id.is_none());
        assert!(backend.locks().await.unwrap().is_empty());
        assert!(backend.list_orchestrator("orch-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_from_waiting_and_running() {
        let backend = JobBackend::new_in_memory();
        let waiting = tester_record(None);
        backend.create(&waiting).await.unwrap();
        backend
            .fail(&waiting.job.id, Some("module exploded"))
            .await
            .unwrap();
        let failed = backend.get(&waiting.job.id).await.unwrap();
        assert_eq!(failed.job.status, JobStatus::Failed);
        assert_eq!(failed.job.reason.as_deref(), Some("module exploded"));
        assert!(backend.list_waiting().await.unwrap().is_empty());

        let running = tester_record(None);
        backend.create(&running).await.unwrap();
        backend.claim("orch-1").await.unwrap().unwrap();
        backend.fail(&running.job.id, None).await.unwrap();
        assert!(backend.list_orchestrator("orch-1").await.unwrap().is_empty());

        // FAILED is terminal.
        assert!(matches!(
            backend.fail(&running.job.id, None).await,
            Err(XjobError::BadState(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_forbidden_while_running() {
        let backend = JobBackend::new_in_memory();
        let record = tester_record(None);
        backend.create(&record).await.unwrap();
        backend.claim("orch-1").await.unwrap().unwrap();

        assert!(matches!(
            backend.delete(&record.job.id).await,
            Err(XjobError::BadState(_))
        ));

        backend.pause(&record.job.id).await.unwrap();
        backend.delete(&record.job.id).await.unwrap();
        assert!(matches!(
            backend.get(&record.job.id).await,
            Err(XjobError::NotFound(_))
        ));
        assert!(backend.list(10, None).await.unwrap().is_empty());
        assert!(backend.list_orchestrator("orch-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_waiting_index_matches_status() {
        // A job is in the waiting index iff its status is WAITING.
        let backend = JobBackend::new_in_memory();
        let record = tester_record(None);
        backend.create(&record).await.unwrap();
        assert_eq!(backend.list_waiting().await.unwrap().len(), 1);

        backend.claim("orch-1").await.unwrap().unwrap();
        assert!(backend.list_waiting().await.unwrap().is_empty());

        backend.pause(&record.job.id).await.unwrap();
        assert!(backend.list_waiting().await.unwrap().is_empty());

        backend.resume(&record.job.id).await.unwrap();
        assert_eq!(backend.list_waiting().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_job_object_round_trip_through_backend() {
        let backend = JobBackend::new_in_memory();
        let registry = ModuleRegistry::builtin();
        let job = Job::create(
            &registry,
            CreateJobRequest {
                job: CreateJobMeta {
                    job_type: "tester".to_string(),
                },
                items: Some(CreateJobItems {
                    max_per_second: Some(500),
                }),
                options: JsonMap::new(),
            },
        )
        .unwrap();

        backend.create(job.record()).await.unwrap();
        let claimed = backend.claim("orch-1").await.unwrap().unwrap();
        let loaded = Job::load(&registry, claimed).unwrap();
        assert_eq!(loaded.max_per_second(), 500);
        assert_eq!(loaded.status(), JobStatus::Running);
    }

    #[tokio::test]
    async fn test_unsupported_endpoint_rejected() {
        assert!(matches!(
            JobBackend::from_endpoint("postgres://nope").await,
            Err(XjobError::Config(_))
        ));
    }
}
