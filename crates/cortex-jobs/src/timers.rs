//! Registry of scheduled tasks per job.
//!
//! Every poll loop and watchdog spawned for a job registers its
//! [`AbortHandle`] here, so teardown can find and stop all of them.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::task::AbortHandle;
use tracing::trace;

use cortex_core::JobId;

/// Job id to the abort handles of its live tasks.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    handles: Mutex<HashMap<JobId, Vec<AbortHandle>>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record handles for a job. Appends to any already registered.
    pub fn register(&self, job_id: &JobId, handles: Vec<AbortHandle>) {
        trace!(job_id = %job_id, count = handles.len(), "Registering timers");
        self.lock()
            .entry(job_id.clone())
            .or_default()
            .extend(handles);
    }

    /// Abort and forget every handle of a job. Returns whether any existed.
    pub fn clear(&self, job_id: &JobId) -> bool {
        let removed = self.lock().remove(job_id);
        match removed {
            Some(handles) => {
                for handle in &handles {
                    handle.abort();
                }
                trace!(job_id = %job_id, count = handles.len(), "Cleared timers");
                true
            }
            None => false,
        }
    }

    /// Abort every registered handle. Returns the number of jobs cleared.
    pub fn clear_all(&self) -> usize {
        let drained: Vec<(JobId, Vec<AbortHandle>)> = self.lock().drain().collect();
        for handle in drained.iter().flat_map(|(_, handles)| handles) {
            handle.abort();
        }
        drained.len()
    }

    /// Number of jobs with registered handles.
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_registered(&self, job_id: &JobId) -> bool {
        self.lock().contains_key(job_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Vec<AbortHandle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
