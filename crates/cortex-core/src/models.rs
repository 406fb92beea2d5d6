//! Domain and wire models shared across cortex crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// =============================================================================
// STREAMING
// =============================================================================

/// One decoded frame of a streamed assistant reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A piece of assistant text.
    Token { text: String },
    /// Logical end of the reply.
    End,
    /// Fatal failure judged from transport signals (never produced by the decoder).
    Error { code: Option<u16>, message: String },
}

impl StreamEvent {
    /// Build a token event.
    pub fn token(text: impl Into<String>) -> Self {
        StreamEvent::Token { text: text.into() }
    }

    /// Build an error event from a cortex error.
    pub fn from_error(err: &Error) -> Self {
        StreamEvent::Error {
            code: err.status_code(),
            message: err.to_string(),
        }
    }

    /// Returns true for `End` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End | StreamEvent::Error { .. })
    }

    /// Token text, if this is a token.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StreamEvent::Token { text } => Some(text.as_str()),
            _ => None,
        }
    }
}

// =============================================================================
// JOBS
// =============================================================================

/// Server-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Server-reported job status. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[serde(alias = "Pending")]
    Pending,
    #[serde(alias = "Running")]
    Running,
    #[serde(alias = "Completed")]
    Completed,
    #[serde(alias = "PartiallyCompleted", alias = "partiallyCompleted")]
    PartiallyCompleted,
    #[serde(alias = "Failed")]
    Failed,
}

impl JobStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::PartiallyCompleted | JobStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::PartiallyCompleted => "partially_completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-side view of a server job. The server is authoritative: this is
/// only ever mutated by applying a status response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub target: String,
    pub owning_user: String,
    pub status: JobStatus,
    /// Percentage in `0..=100`; never decreases while the job is non-terminal.
    pub progress: u8,
    #[serde(default)]
    pub errors: Vec<String>,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    /// A freshly submitted job.
    pub fn new(
        job_id: JobId,
        target: impl Into<String>,
        owning_user: impl Into<String>,
        status: JobStatus,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            target: target.into(),
            owning_user: owning_user.into(),
            status,
            progress: 0,
            errors: Vec::new(),
            submitted_at,
        }
    }

    /// Rebuild a job from its ledger projection.
    pub fn from_entry(entry: &LedgerEntry) -> Self {
        Self::new(
            entry.job_id.clone(),
            entry.target.clone(),
            entry.owning_user.clone(),
            JobStatus::Pending,
            entry.submitted_at,
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status read.
    ///
    /// Progress is clamped to `0..=100` and held monotonic while the job is
    /// non-terminal, so an out-of-order read cannot move the bar backwards.
    pub fn apply(&mut self, response: &JobStatusResponse) {
        let reported = clamp_progress(response.progress);
        self.progress = match response.status {
            JobStatus::Completed => 100,
            status if status.is_terminal() => reported,
            _ => self.progress.max(reported),
        };
        self.status = response.status;
        self.errors = response.errors.clone();
    }

    /// The persisted projection of this job.
    pub fn ledger_entry(&self) -> LedgerEntry {
        LedgerEntry {
            job_id: self.job_id.clone(),
            target: self.target.clone(),
            owning_user: self.owning_user.clone(),
            submitted_at: self.submitted_at,
        }
    }
}

fn clamp_progress(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

/// Persisted projection of a job, sufficient to resume tracking after reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub job_id: JobId,
    pub target: String,
    pub owning_user: String,
    pub submitted_at: DateTime<Utc>,
}

/// What a start request should cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    /// One named target.
    Single(String),
    /// Every known target.
    All,
}

impl TargetSpec {
    pub fn single(target: impl Into<String>) -> Self {
        TargetSpec::Single(target.into())
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, TargetSpec::All)
    }

    /// Expand to concrete target names.
    pub fn expand(&self, known: &[String]) -> Vec<String> {
        match self {
            TargetSpec::Single(target) => vec![target.clone()],
            TargetSpec::All => known.to_vec(),
        }
    }
}

/// One failed branch of a start request.
#[derive(Debug)]
pub struct SubmissionFailure {
    pub target: String,
    pub error: Error,
}

/// Outcome of a start request.
#[derive(Debug, Default)]
pub struct StartReport {
    /// Jobs that were submitted and are now tracked.
    pub jobs: Vec<Job>,
    /// Branches that failed, each reported individually.
    pub failures: Vec<SubmissionFailure>,
}

impl StartReport {
    /// Some branches succeeded and some failed.
    pub fn is_partial(&self) -> bool {
        !self.jobs.is_empty() && !self.failures.is_empty()
    }

    pub fn failed_targets(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.target.as_str()).collect()
    }
}

/// Result of a local-first cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub job_id: JobId,
    /// Whether the job was being tracked locally when cancelled.
    pub was_tracked: bool,
    /// Whether the server confirmed the cancellation.
    pub server_acknowledged: bool,
    pub message: Option<String>,
}

// =============================================================================
// WIRE TYPES
// =============================================================================

/// Body of a chat streaming request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub conversation_id: String,
    pub message: String,
}

/// Body of an indexing start request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartJobRequest {
    pub target: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
}

/// Response to an indexing start request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartJobResponse {
    pub job_id: JobId,
    #[serde(default = "pending_status")]
    pub status: JobStatus,
}

fn pending_status() -> JobStatus {
    JobStatus::Pending
}

/// Response to a status query.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub status: JobStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Response to a cancel request.
#[derive(Debug, Clone, Deserialize)]
pub struct CancelJobResponse {
    #[serde(default)]
    pub message: Option<String>,
}
