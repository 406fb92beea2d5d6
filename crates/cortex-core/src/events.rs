//! Job lifecycle events and the broadcast bus that carries them.
//!
//! The coordinator and poller publish here; presentation code subscribes.
//! This is the callback half of every job flow (the other half being the
//! returned `Result`).

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{JobId, JobStatus};

/// Why a tracked job stopped being polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuiesceReason {
    /// Server reported (and confirmed) a terminal status.
    Terminal,
    /// Cancelled locally.
    Cancelled,
    /// Tracking ceiling reached without a terminal status.
    Expired,
}

impl QuiesceReason {
    pub fn as_str(self) -> &'static str {
        match self {
            QuiesceReason::Terminal => "terminal",
            QuiesceReason::Cancelled => "cancelled",
            QuiesceReason::Expired => "expired",
        }
    }
}

/// Job lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    /// A job was submitted and registered in the ledger.
    Submitted { job_id: JobId, target: String },
    /// A poll changed the job's status or progress.
    Progress {
        job_id: JobId,
        status: JobStatus,
        progress: u8,
    },
    /// The job finished with `completed` or `partially_completed`.
    Completed {
        job_id: JobId,
        target: String,
        status: JobStatus,
        errors: Vec<String>,
    },
    /// The job finished with `failed`.
    Failed {
        job_id: JobId,
        target: String,
        errors: Vec<String>,
    },
    /// The job was cancelled locally.
    Cancelled { job_id: JobId, target: String },
    /// The tracking ceiling was reached.
    Expired { job_id: JobId, target: String },
    /// Some branches of a composite start failed while others succeeded.
    PartialFailure {
        succeeded: Vec<String>,
        failed: Vec<(String, String)>,
    },
}

impl JobEvent {
    /// Dot-namespaced event name (e.g. `"job.completed"`).
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Submitted { .. } => "job.submitted",
            JobEvent::Progress { .. } => "job.progress",
            JobEvent::Completed { .. } => "job.completed",
            JobEvent::Failed { .. } => "job.failed",
            JobEvent::Cancelled { .. } => "job.cancelled",
            JobEvent::Expired { .. } => "job.expired",
            JobEvent::PartialFailure { .. } => "job.partial_failure",
        }
    }

    /// The job this event is about, if it concerns a single job.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            JobEvent::Submitted { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id, .. }
            | JobEvent::Expired { job_id, .. } => Some(job_id),
            JobEvent::PartialFailure { .. } => None,
        }
    }
}

/// Broadcast-based event bus.
///
/// Slow receivers that fall behind get a `Lagged` error and miss events;
/// job state itself is always recoverable from the poller's watch channels.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers. Dropped silently when nobody listens.
    pub fn emit(&self, event: JobEvent) {
        tracing::debug!(
            event_type = event.event_type(),
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(event);
    }

    /// Subscribe to events. Each subscriber gets its own independent stream.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}
