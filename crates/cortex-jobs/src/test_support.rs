//! Scripted [`JobTransport`] for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use cortex_core::{
    CancelJobResponse, Error, JobId, JobStatus, JobStatusResponse, JobTransport, Result,
    StartJobRequest, StartJobResponse,
};

/// One scripted status reply.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Status(JobStatus, f64, Vec<String>),
    Fail,
    NotFound,
}

pub(crate) fn status(status: JobStatus, progress: f64) -> Reply {
    Reply::Status(status, progress, Vec::new())
}

/// Status replies are consumed in order; the last one repeats. Unscripted
/// jobs report `running` at 0%.
#[derive(Default)]
pub(crate) struct ScriptedJobTransport {
    failing_targets: Mutex<HashSet<String>>,
    start_delay: Mutex<Duration>,
    statuses: Mutex<HashMap<JobId, VecDeque<Reply>>>,
    cancel_fails: AtomicBool,
    start_calls: AtomicUsize,
    status_calls: Mutex<HashMap<JobId, usize>>,
    cancel_calls: AtomicUsize,
}

impl ScriptedJobTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_start(&self, target: &str) {
        self.failing_targets.lock().unwrap().insert(target.to_string());
    }

    pub(crate) fn delay_starts(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    pub(crate) fn script(&self, job_id: &str, replies: Vec<Reply>) {
        self.statuses
            .lock()
            .unwrap()
            .insert(JobId::new(job_id), replies.into());
    }

    pub(crate) fn fail_cancel(&self) {
        self.cancel_fails.store(true, Ordering::SeqCst);
    }

    pub(crate) fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fetches(&self, job_id: &str) -> usize {
        self.status_calls
            .lock()
            .unwrap()
            .get(&JobId::new(job_id))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn cancels(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobTransport for ScriptedJobTransport {
    async fn start(&self, request: &StartJobRequest) -> Result<StartJobResponse> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_targets.lock().unwrap().contains(&request.target) {
            return Err(Error::Server {
                status: 500,
                message: format!("{} unavailable", request.target),
            });
        }
        Ok(StartJobResponse {
            job_id: JobId::new(format!("{}-job", request.target)),
            status: JobStatus::Pending,
        })
    }

    async fn status(&self, job_id: &JobId) -> Result<JobStatusResponse> {
        *self
            .status_calls
            .lock()
            .unwrap()
            .entry(job_id.clone())
            .or_default() += 1;

        let reply = {
            let mut statuses = self.statuses.lock().unwrap();
            match statuses.get_mut(job_id) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply.unwrap_or_else(|| status(JobStatus::Running, 0.0)) {
            Reply::Status(status, progress, errors) => Ok(JobStatusResponse {
                status,
                progress,
                errors,
            }),
            Reply::Fail => Err(Error::Transport("connection refused".into())),
            Reply::NotFound => Err(Error::Server {
                status: 404,
                message: "job not found".into(),
            }),
        }
    }

    async fn cancel(&self, _job_id: &JobId) -> Result<CancelJobResponse> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if self.cancel_fails.load(Ordering::SeqCst) {
            return Err(Error::Server {
                status: 502,
                message: "bad gateway".into(),
            });
        }
        Ok(CancelJobResponse {
            message: Some("Job cancelled".into()),
        })
    }
}
