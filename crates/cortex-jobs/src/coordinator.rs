//! Job submission and lifecycle coordination.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use cortex_core::defaults::{DEFAULT_USER, INDEX_PROVIDER, INDEX_TARGETS, LEDGER_MAX_AGE_SECS};
use cortex_core::{
    CancelOutcome, Error, EventBus, Job, JobEvent, JobId, JobStatusResponse, JobTransport,
    LedgerEntry, Result, StartJobRequest, StartReport, SubmissionFailure, TargetSpec,
};

use crate::ledger::JobLedger;
use crate::poller::JobPoller;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// User recorded as the owner of submitted jobs.
    pub user: String,
    /// Targets an "all targets" start expands to.
    pub targets: Vec<String>,
    /// Embedding provider sent with each start request.
    pub provider: String,
    pub model: Option<String>,
    pub dimensions: Option<u32>,
    /// Ledger entries older than this are dropped on resume without asking the server.
    pub ledger_max_age: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            user: DEFAULT_USER.to_string(),
            targets: INDEX_TARGETS.iter().map(|t| t.to_string()).collect(),
            provider: INDEX_PROVIDER.to_string(),
            model: None,
            dimensions: None,
            ledger_max_age: Duration::from_secs(LEDGER_MAX_AGE_SECS),
        }
    }
}

impl CoordinatorConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CORTEX_USER` | `local` | Owner of submitted jobs |
    /// | `CORTEX_TARGETS` | `postgresql,pinecone` | Comma-separated target list |
    /// | `CORTEX_PROVIDER` | `openai` | Embedding provider |
    /// | `CORTEX_MODEL` | (server default) | Embedding model |
    /// | `CORTEX_DIMENSIONS` | (server default) | Embedding dimensions |
    /// | `CORTEX_LEDGER_MAX_AGE_SECS` | `86400` | Ledger entry max age |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let user = std::env::var("CORTEX_USER")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(defaults.user);

        let targets = std::env::var("CORTEX_TARGETS")
            .ok()
            .map(|v| parse_targets(&v))
            .filter(|t| !t.is_empty())
            .unwrap_or(defaults.targets);

        let provider = std::env::var("CORTEX_PROVIDER")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(defaults.provider);

        let model = std::env::var("CORTEX_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty());

        let dimensions = std::env::var("CORTEX_DIMENSIONS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok());

        let ledger_max_age = std::env::var("CORTEX_LEDGER_MAX_AGE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.ledger_max_age);

        Self {
            user,
            targets,
            provider,
            model,
            dimensions,
            ledger_max_age,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_dimensions(mut self, dimensions: u32) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    pub fn with_ledger_max_age(mut self, max_age: Duration) -> Self {
        self.ledger_max_age = max_age;
        self
    }
}

/// Split a comma-separated target list, dropping blanks and duplicates.
fn parse_targets(value: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    value
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_string()))
        .map(String::from)
        .collect()
}

/// A ledger entry that survived reconciliation, with its status fetch result.
type LiveEntry = (LedgerEntry, Result<JobStatusResponse>);

/// Holds a target in the in-flight set until dropped.
struct Reservation<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    target: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.target);
    }
}

/// Submits indexing jobs and owns their client-side lifecycle.
///
/// At most one non-terminal job exists per target for the configured user:
/// a start is refused locally while the target has a ledger entry, a tracked
/// job or a submission in flight.
pub struct JobCoordinator {
    transport: Arc<dyn JobTransport>,
    ledger: JobLedger,
    poller: JobPoller,
    events: EventBus,
    config: CoordinatorConfig,
    in_flight: Mutex<HashSet<String>>,
}

impl JobCoordinator {
    pub fn new(
        transport: Arc<dyn JobTransport>,
        ledger: JobLedger,
        poller: JobPoller,
        events: EventBus,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            transport,
            ledger,
            poller,
            events,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn poller(&self) -> &JobPoller {
        &self.poller
    }

    /// Live state of a tracked job.
    pub fn subscribe(&self, job_id: &JobId) -> Option<watch::Receiver<Job>> {
        self.poller.subscribe(job_id)
    }

    /// Submit jobs for `spec`.
    ///
    /// A single target's failure is returned as is. For all targets, every
    /// branch runs concurrently and independently: if some succeed the report
    /// lists the failures (and a `PartialFailure` event is emitted); if none
    /// succeed the call fails with [`Error::AllSubmissionsFailed`].
    #[instrument(skip(self), fields(user = %self.config.user))]
    pub async fn start(&self, spec: TargetSpec) -> Result<StartReport> {
        let targets = spec.expand(&self.config.targets);
        if !spec.is_composite() {
            let mut report = StartReport::default();
            for target in targets {
                report.jobs.push(self.submit(&target).await?);
            }
            return Ok(report);
        }

        if targets.is_empty() {
            return Err(Error::InvalidInput("No index targets configured".into()));
        }

        let outcomes = join_all(targets.iter().map(|target| self.submit(target))).await;

        let mut report = StartReport::default();
        for (target, outcome) in targets.into_iter().zip(outcomes) {
            match outcome {
                Ok(job) => report.jobs.push(job),
                Err(error) => {
                    warn!(target = %target, error = %error, "Submission failed");
                    report.failures.push(SubmissionFailure { target, error });
                }
            }
        }

        if report.jobs.is_empty() {
            return Err(Error::AllSubmissionsFailed(report.failures));
        }

        if report.is_partial() {
            self.events.emit(JobEvent::PartialFailure {
                succeeded: report.jobs.iter().map(|j| j.target.clone()).collect(),
                failed: report
                    .failures
                    .iter()
                    .map(|f| (f.target.clone(), f.error.to_string()))
                    .collect(),
            });
        }

        Ok(report)
    }

    async fn submit(&self, target: &str) -> Result<Job> {
        let _reservation = self.reserve(target)?;

        let request = StartJobRequest {
            target: target.to_string(),
            provider: self.config.provider.clone(),
            model: self.config.model.clone(),
            dimensions: self.config.dimensions,
        };
        let response = self.transport.start(&request).await?;

        let job = Job::new(
            response.job_id,
            target,
            self.config.user.clone(),
            response.status,
            Utc::now(),
        );
        if let Err(e) = self.ledger.put(&job.ledger_entry()) {
            warn!(job_id = %job.job_id, error = %e, "Failed to persist ledger entry");
        }

        self.events.emit(JobEvent::Submitted {
            job_id: job.job_id.clone(),
            target: job.target.clone(),
        });
        self.poller.track(job.clone());

        info!(job_id = %job.job_id, target = %target, "Job submitted");
        Ok(job)
    }

    /// Claim `target` for a submission, refusing if a job is already active.
    fn reserve(&self, target: &str) -> Result<Reservation<'_>> {
        let mut in_flight = self.lock_in_flight();

        let active = if in_flight.contains(target) {
            Some(None)
        } else if let Some(job) = self.tracked_for(target) {
            Some(Some(job.job_id))
        } else {
            self.ledger
                .find_by_target(&self.config.user, target)
                .map(|entry| Some(entry.job_id))
        };

        if let Some(job_id) = active {
            debug!(target = %target, job_id = ?job_id, "Refusing duplicate submission");
            return Err(Error::JobAlreadyActive {
                target: target.to_string(),
                job_id: job_id.map(|id| id.to_string()),
            });
        }

        in_flight.insert(target.to_string());
        Ok(Reservation {
            in_flight: &self.in_flight,
            target: target.to_string(),
        })
    }

    fn tracked_for(&self, target: &str) -> Option<Job> {
        self.poller
            .tracked_jobs()
            .into_iter()
            .find(|j| j.target == target && j.owning_user == self.config.user && !j.is_terminal())
    }

    /// Cancel a job: local state is cleared first, then the server is asked
    /// (best effort).
    #[instrument(skip(self, job_id), fields(job_id = %job_id))]
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<CancelOutcome> {
        if job_id.as_str().trim().is_empty() {
            return Err(Error::InvalidInput("Job id is empty".into()));
        }

        let was_tracked = self.poller.untrack(job_id);
        if let Err(e) = self.ledger.remove(job_id) {
            warn!(error = %e, "Failed to remove ledger entry");
        }

        let outcome = match self.transport.cancel(job_id).await {
            Ok(response) => CancelOutcome {
                job_id: job_id.clone(),
                was_tracked,
                server_acknowledged: true,
                message: response.message,
            },
            Err(e) => {
                warn!(error = %e, "Server cancel failed, job cleared locally");
                CancelOutcome {
                    job_id: job_id.clone(),
                    was_tracked,
                    server_acknowledged: false,
                    message: Some(e.to_string()),
                }
            }
        };

        info!(
            was_tracked,
            server_acknowledged = outcome.server_acknowledged,
            "Job cancelled"
        );
        Ok(outcome)
    }

    /// Active jobs of the configured user, keyed by target.
    ///
    /// Ledger entries not yet resumed are reported as pending.
    pub fn active_jobs_by_target(&self) -> HashMap<String, Job> {
        let mut active: HashMap<String, Job> = self
            .ledger
            .list_by_user(&self.config.user)
            .iter()
            .map(|entry| (entry.target.clone(), Job::from_entry(entry)))
            .collect();

        for job in self.poller.tracked_jobs() {
            if job.owning_user == self.config.user && !job.is_terminal() {
                active.insert(job.target.clone(), job);
            }
        }
        active
    }

    pub fn is_job_active(&self, target: &str) -> bool {
        self.lock_in_flight().contains(target) || self.active_jobs_by_target().contains_key(target)
    }

    /// Build a coordinator and drop ledger entries whose jobs already
    /// finished, so the duplicate guard and [`active_jobs_by_target`]
    /// never see them.
    ///
    /// [`active_jobs_by_target`]: Self::active_jobs_by_target
    pub async fn open(
        transport: Arc<dyn JobTransport>,
        ledger: JobLedger,
        poller: JobPoller,
        events: EventBus,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        let coordinator = Self::new(transport, ledger, poller, events, config);
        let (pruned, live) = coordinator.reconcile().await?;
        info!(
            pruned,
            pending = live.len(),
            "Ledger reconciled with server"
        );
        Ok(coordinator)
    }

    /// Pick up jobs recorded in the ledger (after a reload).
    ///
    /// Expired entries are pruned first. Each remaining entry's status is
    /// fetched; terminal and unknown jobs are pruned, the rest are tracked.
    #[instrument(skip(self), fields(user = %self.config.user))]
    pub async fn resume(&self) -> Result<Vec<Job>> {
        let (pruned, live) = self.reconcile().await?;

        let mut resumed = Vec::with_capacity(live.len());
        for (entry, status) in live {
            let mut job = Job::from_entry(&entry);
            match status {
                Ok(response) => job.apply(&response),
                Err(e) => {
                    warn!(job_id = %entry.job_id, error = %e, "Status unavailable, resuming anyway")
                }
            }
            self.poller.track(job.clone());
            resumed.push(job);
        }

        info!(resumed = resumed.len(), pruned, "Resumed jobs from ledger");
        Ok(resumed)
    }

    /// Prune expired entries, then fetch the status of every untracked entry
    /// of the configured user and prune the finished or unknown ones.
    ///
    /// Returns the number of pruned entries and the entries still live,
    /// each with its status fetch result.
    async fn reconcile(&self) -> Result<(usize, Vec<LiveEntry>)> {
        let expired = self
            .ledger
            .prune_expired(self.config.ledger_max_age, Utc::now())?;

        let entries: Vec<_> = self
            .ledger
            .list_by_user(&self.config.user)
            .into_iter()
            .filter(|e| !self.poller.is_tracking(&e.job_id))
            .collect();

        let statuses = join_all(entries.iter().map(|e| self.transport.status(&e.job_id))).await;

        let mut pruned = expired.len();
        let mut live = Vec::new();
        for (entry, status) in entries.into_iter().zip(statuses) {
            let finished = match &status {
                Ok(response) if response.status.is_terminal() => {
                    debug!(job_id = %entry.job_id, status = %response.status, "Pruning finished job");
                    true
                }
                Err(Error::Server { status: 404, .. }) => {
                    debug!(job_id = %entry.job_id, "Pruning job unknown to server");
                    true
                }
                _ => false,
            };

            if !finished {
                live.push((entry, status));
                continue;
            }
            match self.ledger.remove(&entry.job_id) {
                Ok(_) => pruned += 1,
                Err(e) => warn!(job_id = %entry.job_id, error = %e, "Failed to prune ledger entry"),
            }
        }
        Ok((pruned, live))
    }

    /// Poll every tracked job now (e.g. when the user returns to the app).
    pub fn refresh(&self) -> usize {
        self.poller.poll_all_now()
    }

    /// Consumer teardown. Ledger entries survive for a later [`resume`](Self::resume).
    pub fn shutdown(&self) {
        self.poller.shutdown();
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
