//! # In-Memory Backend
//!
//! Mutex-guarded implementation of the job store. Every compound operation
//! holds the one lock for its whole duration, which gives the same
//! atomicity the Redis scripts provide. Used by tests and single-node
//! development runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

use chrono::Utc;

use crate::errors::{XjobError, XjobResult};
use crate::job::record::{JobRecord, JobStatus, JobUpdate};

#[derive(Debug, Default)]
struct MemoryState {
    /// All records, keyed (and therefore ordered) by id
    jobs: BTreeMap<String, JobRecord>,
    /// Waiting index; id order is creation order
    waiting: BTreeSet<String>,
    /// Per-orchestrator assignment sets
    orchestrators: HashMap<String, BTreeSet<String>>,
    /// Advisory locks: key -> holding job id
    locks: BTreeMap<String, String>,
}

/// Mutex-guarded job store
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

fn held_lock(record: &JobRecord) -> Option<&str> {
    record.job.lock.as_deref().filter(|lock| !lock.is_empty())
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn create(&self, record: &JobRecord) -> XjobResult<()> {
        let mut state = self.lock();
        let id = record.job.id.clone();
        if state.jobs.contains_key(&id) {
            return Err(XjobError::Conflict(id));
        }

        let mut record = record.clone();
        record.job.status = JobStatus::Waiting;
        state.jobs.insert(id.clone(), record);
        state.waiting.insert(id);
        Ok(())
    }

    pub fn list(&self, limit: usize, marker: Option<&str>) -> XjobResult<Vec<JobRecord>> {
        let state = self.lock();
        let lower = match marker {
            Some(marker) => Bound::Excluded(marker.to_string()),
            None => Bound::Unbounded,
        };
        Ok(state
            .jobs
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    pub fn list_waiting(&self) -> XjobResult<Vec<JobRecord>> {
        let state = self.lock();
        Ok(state
            .waiting
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }

    pub fn list_orchestrator(&self, orchestrator_id: &str) -> XjobResult<Vec<JobRecord>> {
        let state = self.lock();
        Ok(state
            .orchestrators
            .get(orchestrator_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }

    pub fn get(&self, id: &str) -> XjobResult<JobRecord> {
        let state = self.lock();
        state
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| XjobError::NotFound(id.to_string()))
    }

    pub fn update(&self, id: &str, delta: &JobUpdate) -> XjobResult<JobRecord> {
        let mut state = self.lock();
        let record = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| XjobError::NotFound(id.to_string()))?;
        record.apply_update(delta, Utc::now().timestamp());
        Ok(record.clone())
    }

    pub fn claim(&self, orchestrator_id: &str) -> XjobResult<Option<JobRecord>> {
        let mut state = self.lock();
        let now = Utc::now().timestamp();

        // Waiting iterates in id order: the queue is FIFO. Jobs whose lock
        // is held stay in place and are revisited on the next claim.
        let candidate = state.waiting.iter().cloned().find(|id| {
            state
                .jobs
                .get(id)
                .and_then(held_lock)
                .is_none_or(|lock| !state.locks.contains_key(lock))
        });
        let Some(id) = candidate else {
            return Ok(None);
        };

        state.waiting.remove(&id);
        state
            .orchestrators
            .entry(orchestrator_id.to_string())
            .or_default()
            .insert(id.clone());

        let record = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| XjobError::NotFound(id.clone()))?;
        record.job.status = JobStatus::Running;
        record.job.orchestrator_id = Some(orchestrator_id.to_string());
        record.job.mtime = record.job.mtime.max(now);
        let record = record.clone();

        if let Some(lock) = held_lock(&record) {
            state.locks.insert(lock.to_string(), id);
        }
        Ok(Some(record))
    }

    fn release_lock(state: &mut MemoryState, id: &str, lock: Option<&str>) {
        if let Some(lock) = lock {
            if state.locks.get(lock).is_some_and(|holder| holder == id) {
                state.locks.remove(lock);
            }
        }
    }

    pub fn pause(&self, id: &str) -> XjobResult<()> {
        let mut state = self.lock();
        let now = Utc::now().timestamp();
        let record = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| XjobError::NotFound(id.to_string()))?;
        if record.job.status != JobStatus::Running {
            return Err(XjobError::bad_state(format!(
                "cannot pause a {} job",
                record.job.status
            )));
        }
        record.job.status = JobStatus::Paused;
        record.job.mtime = record.job.mtime.max(now);
        let lock = held_lock(record).map(str::to_string);
        Self::release_lock(&mut state, id, lock.as_deref());
        Ok(())
    }

    pub fn resume(&self, id: &str) -> XjobResult<()> {
        let mut state = self.lock();
        let now = Utc::now().timestamp();
        let record = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| XjobError::NotFound(id.to_string()))?;
        if record.job.status != JobStatus::Paused {
            return Err(XjobError::bad_state(format!(
                "cannot resume a {} job",
                record.job.status
            )));
        }
        record.job.status = JobStatus::Waiting;
        record.job.mtime = record.job.mtime.max(now);
        let orchestrator_id = record.job.orchestrator_id.take();

        if let Some(orchestrator_id) = orchestrator_id {
            if let Some(assigned) = state.orchestrators.get_mut(&orchestrator_id) {
                assigned.remove(id);
            }
        }
        state.waiting.insert(id.to_string());
        Ok(())
    }

    pub fn finish(&self, id: &str) -> XjobResult<()> {
        let mut state = self.lock();
        let now = Utc::now().timestamp();
        let record = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| XjobError::NotFound(id.to_string()))?;
        if record.job.status != JobStatus::Running {
            return Err(XjobError::bad_state(format!(
                "cannot finish a {} job",
                record.job.status
            )));
        }
        record.job.status = JobStatus::Finished;
        record.job.mtime = record.job.mtime.max(now);
        let orchestrator_id = record.job.orchestrator_id.take();
        let lock = held_lock(record).map(str::to_string);

        if let Some(orchestrator_id) = orchestrator_id {
            if let Some(assigned) = state.orchestrators.get_mut(&orchestrator_id) {
                assigned.remove(id);
            }
        }
        Self::release_lock(&mut state, id, lock.as_deref());
        Ok(())
    }

    pub fn fail(&self, id: &str, reason: Option<&str>) -> XjobResult<()> {
        let mut state = self.lock();
        let now = Utc::now().timestamp();
        let record = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| XjobError::NotFound(id.to_string()))?;

        match record.job.status {
            JobStatus::Running => {
                let orchestrator_id = record.job.orchestrator_id.take();
                let lock = held_lock(record).map(str::to_string);
                record.job.status = JobStatus::Failed;
                record.job.reason = reason.map(str::to_string);
                record.job.mtime = record.job.mtime.max(now);

                if let Some(orchestrator_id) = orchestrator_id {
                    if let Some(assigned) = state.orchestrators.get_mut(&orchestrator_id) {
                        assigned.remove(id);
                    }
                }
                Self::release_lock(&mut state, id, lock.as_deref());
                Ok(())
            }
            JobStatus::Waiting => {
                record.job.status = JobStatus::Failed;
                record.job.reason = reason.map(str::to_string);
                record.job.mtime = record.job.mtime.max(now);
                state.waiting.remove(id);
                Ok(())
            }
            status => Err(XjobError::bad_state(format!("cannot fail a {status} job"))),
        }
    }

    pub fn delete(&self, id: &str) -> XjobResult<()> {
        let mut state = self.lock();
        let record = state
            .jobs
            .get(id)
            .ok_or_else(|| XjobError::NotFound(id.to_string()))?;
        if record.job.status == JobStatus::Running {
            return Err(XjobError::bad_state("cannot delete a RUNNING job"));
        }

        let orchestrator_id = record.job.orchestrator_id.clone();
        let lock = held_lock(record).map(str::to_string);

        state.jobs.remove(id);
        state.waiting.remove(id);
        if let Some(orchestrator_id) = orchestrator_id {
            if let Some(assigned) = state.orchestrators.get_mut(&orchestrator_id) {
                assigned.remove(id);
            }
        }
        Self::release_lock(&mut state, id, lock.as_deref());
        Ok(())
    }

    pub fn locks(&self) -> XjobResult<BTreeMap<String, String>> {
        Ok(self.lock().locks.clone())
    }
}
