//! Per-endpoint worker affinity.
//!
//! The scheduler assigns one of N workers to each acquisition so that
//! repeated acquisitions for the same endpoint land on the same worker
//! whenever possible, while spreading load once a worker is busy. Ordered
//! per-endpoint work can therefore run single-threaded.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::endpoint::Endpoint;

#[derive(Debug, Clone)]
struct WorkerEntry {
    id: usize,
    active_requests: usize,
}

struct SchedulerInner {
    workers: usize,
    entries: Mutex<AHashMap<Endpoint, Vec<WorkerEntry>>>,
}

/// Assigns a worker to each (endpoint) acquisition.
///
/// For every endpoint the scheduler keeps one entry per worker with a
/// stable id and an active-request counter. [`acquire`](Self::acquire)
/// picks the entry with the fewest active requests; ties go to the lowest
/// id, which keeps the assignment stable under low load.
#[derive(Clone)]
pub struct EventLoopScheduler {
    inner: Arc<SchedulerInner>,
}

impl EventLoopScheduler {
    /// Creates a scheduler over `workers` workers.
    ///
    /// # Panics
    ///
    /// Panics when `workers` is zero.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "scheduler requires at least one worker");
        Self {
            inner: Arc::new(SchedulerInner {
                workers,
                entries: Mutex::new(AHashMap::new()),
            }),
        }
    }

    /// The number of workers.
    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Acquires the least-loaded worker for `endpoint`. The returned lease
    /// releases the worker when dropped.
    pub fn acquire(&self, endpoint: &Endpoint) -> WorkerLease {
        let worker_id = {
            let mut entries = self.inner.entries.lock();
            let list = entries.entry(endpoint.clone()).or_insert_with(|| {
                (0..self.inner.workers)
                    .map(|id| WorkerEntry {
                        id,
                        active_requests: 0,
                    })
                    .collect()
            });
            let entry = list
                .iter_mut()
                .min_by_key(|e| (e.active_requests, e.id))
                .expect("scheduler entry list is never empty");
            entry.active_requests += 1;
            entry.id
        };
        WorkerLease {
            inner: self.inner.clone(),
            endpoint: endpoint.clone(),
            worker_id,
        }
    }

    /// The sum of active-request counters for `endpoint`.
    pub fn active_requests(&self, endpoint: &Endpoint) -> usize {
        self.inner
            .entries
            .lock()
            .get(endpoint)
            .map(|list| list.iter().map(|e| e.active_requests).sum())
            .unwrap_or(0)
    }

    /// The sum of active-request counters across all endpoints.
    pub fn total_active_requests(&self) -> usize {
        self.inner
            .entries
            .lock()
            .values()
            .flat_map(|list| list.iter().map(|e| e.active_requests))
            .sum()
    }

    #[cfg(test)]
    fn entry_count(&self, endpoint: &Endpoint) -> usize {
        self.inner
            .entries
            .lock()
            .get(endpoint)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// An acquired worker assignment. Dropping the lease releases it.
pub struct WorkerLease {
    inner: Arc<SchedulerInner>,
    endpoint: Endpoint,
    worker_id: usize,
}

impl WorkerLease {
    /// The stable id of the assigned worker.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// The endpoint the lease was acquired for.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let mut entries = self.inner.entries.lock();
        if let Some(list) = entries.get_mut(&self.endpoint) {
            if let Some(entry) = list.iter_mut().find(|e| e.id == self.worker_id) {
                debug_assert!(entry.active_requests > 0, "unbalanced worker release");
                entry.active_requests = entry.active_requests.saturating_sub(1);
            }
        }
    }
}
