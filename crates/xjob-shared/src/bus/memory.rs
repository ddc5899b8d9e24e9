//! # In-Memory Bus
//!
//! A process-local stand-in for the FIFO queue service, keyed by endpoint
//! address and tube name. Used by tests and single-process development runs;
//! the semantics mirror what the engine relies on from beanstalkd: FIFO
//! order, reserve/delete/bury, tube introspection, and a bounded ready
//! queue so "worker full" is observable.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::errors::{XjobError, XjobResult};

const RESERVE_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct TubeState {
    next_id: u64,
    ready: VecDeque<(u64, Vec<u8>)>,
    reserved: HashMap<u64, Vec<u8>>,
    buried: Vec<(u64, Vec<u8>)>,
}

/// Shared registry of endpoints and tubes
#[derive(Debug)]
pub struct MemoryBus {
    endpoints: Mutex<HashMap<String, HashMap<String, TubeState>>>,
    /// Ready-queue bound per tube; puts beyond it report "full"
    capacity: usize,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, TubeState>>> {
        self.endpoints.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Pre-create an endpoint advertising the given tubes.
    pub fn register(&self, addr: &str, tubes: &[&str]) {
        let mut endpoints = self.lock();
        let endpoint = endpoints.entry(addr.to_string()).or_default();
        for tube in tubes {
            endpoint.entry(tube.to_string()).or_default();
        }
    }

    pub(crate) fn tubes(&self, addr: &str) -> XjobResult<Vec<String>> {
        let endpoints = self.lock();
        let endpoint = endpoints.get(addr).ok_or_else(|| {
            XjobError::bus_unavailable(format!("no in-memory endpoint at {addr}"))
        })?;
        let mut tubes: Vec<String> = endpoint.keys().cloned().collect();
        tubes.sort_unstable();
        Ok(tubes)
    }

    pub(crate) fn try_put(&self, addr: &str, tube: &str, payload: &[u8]) -> XjobResult<bool> {
        let mut endpoints = self.lock();
        let endpoint = endpoints.get_mut(addr).ok_or_else(|| {
            XjobError::bus_unavailable(format!("no in-memory endpoint at {addr}"))
        })?;
        let state = endpoint.entry(tube.to_string()).or_default();

        if state.ready.len() >= self.capacity {
            return Ok(false);
        }
        state.next_id += 1;
        state.ready.push_back((state.next_id, payload.to_vec()));
        Ok(true)
    }

    fn try_reserve(&self, addr: &str, tube: &str) -> XjobResult<Option<(u64, Vec<u8>)>> {
        let mut endpoints = self.lock();
        let endpoint = endpoints.get_mut(addr).ok_or_else(|| {
            XjobError::bus_unavailable(format!("no in-memory endpoint at {addr}"))
        })?;
        let state = endpoint.entry(tube.to_string()).or_default();

        match state.ready.pop_front() {
            None => Ok(None),
            Some((id, payload)) => {
                state.reserved.insert(id, payload.clone());
                Ok(Some((id, payload)))
            }
        }
    }

    pub(crate) async fn reserve(
        &self,
        addr: &str,
        tube: &str,
        timeout: Duration,
    ) -> XjobResult<Option<(u64, Vec<u8>)>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.try_reserve(addr, tube)? {
                return Ok(Some(job));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RESERVE_POLL_INTERVAL).await;
        }
    }

    pub(crate) fn delete(&self, addr: &str, tube: &str, id: u64) -> XjobResult<()> {
        let mut endpoints = self.lock();
        if let Some(state) = endpoints.get_mut(addr).and_then(|e| e.get_mut(tube)) {
            state.reserved.remove(&id);
        }
        Ok(())
    }

    pub(crate) fn bury(&self, addr: &str, tube: &str, id: u64) -> XjobResult<()> {
        let mut endpoints = self.lock();
        if let Some(state) = endpoints.get_mut(addr).and_then(|e| e.get_mut(tube)) {
            if let Some(payload) = state.reserved.remove(&id) {
                state.buried.push((id, payload));
            }
        }
        Ok(())
    }

    /// Number of buried jobs on a tube (test observability)
    pub fn buried_count(&self, addr: &str, tube: &str) -> usize {
        self.lock()
            .get(addr)
            .and_then(|e| e.get(tube))
            .map_or(0, |state| state.buried.len())
    }

    /// Number of ready jobs on a tube (test observability)
    pub fn ready_count(&self, addr: &str, tube: &str) -> usize {
        self.lock()
            .get(addr)
            .and_then(|e| e.get(tube))
            .map_or(0, |state| state.ready.len())
    }
}
