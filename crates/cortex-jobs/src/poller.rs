//! Status polling for submitted jobs.
//!
//! Each tracked job gets a poll loop and a watchdog, both registered in the
//! [`TimerRegistry`]. A job moves through these phases:
//!
//! ```text
//! Polling --terminal read--> Confirming --terminal read--> (quiesced)
//!    ^                            |
//!    +------non-terminal read-----+
//! ```
//!
//! A terminal read is only trusted once a second, immediate fetch agrees. If
//! the confirmation fetch itself fails, the first terminal read is used.
//! Quiescing removes the job from the poller and the ledger, clears its
//! timers, publishes the final state and emits one event, exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, info, trace, warn};

use cortex_core::defaults::{JOB_MAX_TRACKING_SECS, JOB_POLL_INTERVAL_MS};
use cortex_core::{
    EventBus, Job, JobEvent, JobId, JobStatus, JobStatusResponse, JobTransport, QuiesceReason,
};

use crate::ledger::JobLedger;
use crate::timers::TimerRegistry;

/// Poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay between status fetches.
    pub poll_interval: Duration,
    /// Tracking stops after this long even without a terminal status.
    pub max_tracking: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(JOB_POLL_INTERVAL_MS),
            max_tracking: Duration::from_secs(JOB_MAX_TRACKING_SECS),
        }
    }
}

impl PollerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CORTEX_POLL_INTERVAL_MS` | `1000` | Status poll interval |
    /// | `CORTEX_MAX_TRACKING_SECS` | `1800` | Tracking ceiling per job |
    pub fn from_env() -> Self {
        let poll_interval_ms = std::env::var("CORTEX_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(JOB_POLL_INTERVAL_MS)
            .max(1);

        let max_tracking_secs = std::env::var("CORTEX_MAX_TRACKING_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(JOB_MAX_TRACKING_SECS);

        Self {
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_tracking: Duration::from_secs(max_tracking_secs),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_tracking(mut self, max: Duration) -> Self {
        self.max_tracking = max;
        self
    }
}

/// Where a tracked job is in the confirmation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Polling,
    /// A terminal status was read; waiting for the confirmation fetch.
    Confirming,
}

struct Tracked {
    state: watch::Sender<Job>,
    phase: PollPhase,
    /// The unconfirmed terminal read while `Confirming`.
    terminal_read: Option<JobStatusResponse>,
    poke: Arc<Notify>,
}

/// What the poll loop does after a fetch.
enum Step {
    Wait,
    Immediate,
    Done,
}

struct Inner {
    transport: Arc<dyn JobTransport>,
    ledger: JobLedger,
    timers: Arc<TimerRegistry>,
    events: EventBus,
    config: PollerConfig,
    tracked: Mutex<HashMap<JobId, Tracked>>,
    shut_down: AtomicBool,
}

/// Polls tracked jobs until they quiesce.
#[derive(Clone)]
pub struct JobPoller {
    inner: Arc<Inner>,
}

impl JobPoller {
    pub fn new(
        transport: Arc<dyn JobTransport>,
        ledger: JobLedger,
        timers: Arc<TimerRegistry>,
        events: EventBus,
        config: PollerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                ledger,
                timers,
                events,
                config,
                tracked: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Start polling a job and return its live state.
    ///
    /// Tracking an id that is already tracked returns a new receiver for the
    /// existing state. After [`shutdown`](Self::shutdown) the job is not
    /// polled and the receiver only ever holds `job`.
    pub fn track(&self, job: Job) -> watch::Receiver<Job> {
        let job_id = job.job_id.clone();
        let mut tracked = self.inner.lock_tracked();

        if let Some(existing) = tracked.get(&job_id) {
            trace!(job_id = %job_id, "Job already tracked");
            return existing.state.subscribe();
        }

        let target = job.target.clone();
        let (state, rx) = watch::channel(job);
        if self.inner.shut_down.load(Ordering::SeqCst) {
            debug!(job_id = %job_id, "Poller shut down, not tracking job");
            return rx;
        }

        let poke = Arc::new(Notify::new());
        tracked.insert(
            job_id.clone(),
            Tracked {
                state,
                phase: PollPhase::Polling,
                terminal_read: None,
                poke: poke.clone(),
            },
        );

        // Registered before the lock is released, so a fast quiesce always
        // finds the handles.
        let poll = tokio::spawn(run_poll_loop(self.inner.clone(), job_id.clone(), poke));
        let watchdog = tokio::spawn(run_watchdog(self.inner.clone(), job_id.clone()));
        self.inner
            .timers
            .register(&job_id, vec![poll.abort_handle(), watchdog.abort_handle()]);

        info!(job_id = %job_id, target = %target, "Tracking job");
        rx
    }

    /// Stop tracking a job locally (cancellation). Returns whether it was tracked.
    pub fn untrack(&self, job_id: &JobId) -> bool {
        self.inner.quiesce(job_id, QuiesceReason::Cancelled, None)
    }

    /// Fetch a job's status now instead of waiting for the next tick.
    pub fn poll_now(&self, job_id: &JobId) -> bool {
        match self.inner.lock_tracked().get(job_id) {
            Some(tracked) => {
                tracked.poke.notify_one();
                true
            }
            None => false,
        }
    }

    /// [`poll_now`](Self::poll_now) for every tracked job. Returns how many were poked.
    pub fn poll_all_now(&self) -> usize {
        let tracked = self.inner.lock_tracked();
        for entry in tracked.values() {
            entry.poke.notify_one();
        }
        tracked.len()
    }

    /// Consumer teardown: stop every timer and drop all tracked state.
    /// Ledger entries are kept so tracking can resume later.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let dropped = {
            let mut tracked = self.inner.lock_tracked();
            let count = tracked.len();
            tracked.clear();
            count
        };
        let cleared = self.inner.timers.clear_all();
        info!(tracked = dropped, timers = cleared, "Poller shut down");
    }

    pub fn is_tracking(&self, job_id: &JobId) -> bool {
        self.inner.lock_tracked().contains_key(job_id)
    }

    pub fn phase(&self, job_id: &JobId) -> Option<PollPhase> {
        self.inner.lock_tracked().get(job_id).map(|t| t.phase)
    }

    /// Current state of a tracked job.
    pub fn job(&self, job_id: &JobId) -> Option<Job> {
        self.inner
            .lock_tracked()
            .get(job_id)
            .map(|t| t.state.borrow().clone())
    }

    pub fn subscribe(&self, job_id: &JobId) -> Option<watch::Receiver<Job>> {
        self.inner
            .lock_tracked()
            .get(job_id)
            .map(|t| t.state.subscribe())
    }

    /// Snapshot of every tracked job.
    pub fn tracked_jobs(&self) -> Vec<Job> {
        self.inner
            .lock_tracked()
            .values()
            .map(|t| t.state.borrow().clone())
            .collect()
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.lock_tracked().len()
    }
}

impl Inner {
    fn lock_tracked(&self) -> MutexGuard<'_, HashMap<JobId, Tracked>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn poll_once(&self, job_id: &JobId) -> Step {
        let result = self.transport.status(job_id).await;

        let mut tracked = self.lock_tracked();
        let Some(entry) = tracked.get_mut(job_id) else {
            trace!(job_id = %job_id, "Discarding stale poll result");
            return Step::Done;
        };

        match (entry.phase, result) {
            (PollPhase::Polling, Ok(response)) if response.status.is_terminal() => {
                debug!(job_id = %job_id, status = %response.status, "Terminal status read, confirming");
                entry.phase = PollPhase::Confirming;
                entry.terminal_read = Some(response);
                Step::Immediate
            }
            (PollPhase::Confirming, Ok(response)) if response.status.is_terminal() => {
                drop(tracked);
                self.quiesce(job_id, QuiesceReason::Terminal, Some(&response));
                Step::Done
            }
            (phase, Ok(response)) => {
                if phase == PollPhase::Confirming {
                    debug!(job_id = %job_id, status = %response.status, "Confirmation not terminal, resuming polling");
                    entry.phase = PollPhase::Polling;
                    entry.terminal_read = None;
                }
                let changed = entry.state.send_if_modified(|job| {
                    let before = job.clone();
                    job.apply(&response);
                    *job != before
                });
                if changed {
                    let job = entry.state.borrow().clone();
                    trace!(job_id = %job_id, status = %job.status, progress = job.progress, "Job progressed");
                    self.events.emit(JobEvent::Progress {
                        job_id: job.job_id,
                        status: job.status,
                        progress: job.progress,
                    });
                }
                Step::Wait
            }
            (PollPhase::Polling, Err(e)) => {
                warn!(job_id = %job_id, error = %e, "Status poll failed");
                Step::Wait
            }
            (PollPhase::Confirming, Err(e)) => {
                let terminal_read = entry.terminal_read.take();
                drop(tracked);
                warn!(job_id = %job_id, error = %e, "Confirmation fetch failed, using terminal read");
                self.quiesce(job_id, QuiesceReason::Terminal, terminal_read.as_ref());
                Step::Done
            }
        }
    }

    /// Stop tracking a job. Returns false if it was no longer tracked.
    fn quiesce(
        &self,
        job_id: &JobId,
        reason: QuiesceReason,
        response: Option<&JobStatusResponse>,
    ) -> bool {
        let entry = {
            let mut tracked = self.lock_tracked();
            let Some(entry) = tracked.remove(job_id) else {
                return false;
            };
            self.timers.clear(job_id);
            entry
        };

        if let Err(e) = self.ledger.remove(job_id) {
            warn!(job_id = %job_id, error = %e, "Failed to remove ledger entry");
        }

        let mut job = entry.state.borrow().clone();
        if let Some(response) = response {
            job.apply(response);
        }
        entry.state.send_replace(job.clone());

        info!(
            job_id = %job_id,
            target = %job.target,
            status = %job.status,
            reason = reason.as_str(),
            "Job quiesced"
        );

        let event = match reason {
            QuiesceReason::Terminal if job.status == JobStatus::Failed => JobEvent::Failed {
                job_id: job.job_id,
                target: job.target,
                errors: job.errors,
            },
            QuiesceReason::Terminal => JobEvent::Completed {
                job_id: job.job_id,
                target: job.target,
                status: job.status,
                errors: job.errors,
            },
            QuiesceReason::Cancelled => JobEvent::Cancelled {
                job_id: job.job_id,
                target: job.target,
            },
            QuiesceReason::Expired => JobEvent::Expired {
                job_id: job.job_id,
                target: job.target,
            },
        };
        self.events.emit(event);
        true
    }
}

async fn run_poll_loop(inner: Arc<Inner>, job_id: JobId, poke: Arc<Notify>) {
    loop {
        match inner.poll_once(&job_id).await {
            Step::Done => return,
            Step::Immediate => continue,
            Step::Wait => {}
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
            _ = poke.notified() => {
                trace!(job_id = %job_id, "Out-of-cadence poll");
            }
        }
    }
}

async fn run_watchdog(inner: Arc<Inner>, job_id: JobId) {
    tokio::time::sleep(inner.config.max_tracking).await;
    if inner.quiesce(&job_id, QuiesceReason::Expired, None) {
        warn!(
            job_id = %job_id,
            limit_secs = inner.config.max_tracking.as_secs(),
            "Tracking ceiling reached, job no longer polled"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{status, Reply, ScriptedJobTransport};
    use chrono::Utc;
    use cortex_core::{KeyValueStore, MemoryStore};
    use tokio::sync::broadcast;

    struct Harness {
        transport: Arc<ScriptedJobTransport>,
        store: Arc<MemoryStore>,
        ledger: JobLedger,
        timers: Arc<TimerRegistry>,
        events: EventBus,
        poller: JobPoller,
    }

    fn harness(config: PollerConfig) -> Harness {
        let transport = ScriptedJobTransport::new();
        let store = Arc::new(MemoryStore::new());
        let ledger = JobLedger::new(store.clone());
        let timers = Arc::new(TimerRegistry::new());
        let events = EventBus::new(64);
        let poller = JobPoller::new(
            transport.clone(),
            ledger.clone(),
            timers.clone(),
            events.clone(),
            config,
        );
        Harness {
            transport,
            store,
            ledger,
            timers,
            events,
            poller,
        }
    }

    fn default_harness() -> Harness {
        harness(PollerConfig::default())
    }

    fn job(id: &str) -> Job {
        Job::new(
            JobId::new(id),
            "postgresql",
            "alice",
            JobStatus::Pending,
            Utc::now(),
        )
    }

    fn drain(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn count(events: &[JobEvent], event_type: &str) -> usize {
        events.iter().filter(|e| e.event_type() == event_type).count()
    }

    #[test]
    fn test_poller_config_builder() {
        let config = PollerConfig::default()
            .with_poll_interval(Duration::from_millis(250))
            .with_max_tracking(Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.max_tracking, Duration::from_secs(60));
        assert_eq!(
            PollerConfig::default().poll_interval,
            Duration::from_millis(JOB_POLL_INTERVAL_MS)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_completion_quiesces_once() {
        let h = default_harness();
        h.transport.script(
            "j1",
            vec![
                status(JobStatus::Pending, 0.0),
                status(JobStatus::Running, 40.0),
                status(JobStatus::Completed, 100.0),
                status(JobStatus::Completed, 100.0),
            ],
        );
        let job = job("j1");
        h.ledger.put(&job.ledger_entry()).unwrap();
        let mut events = h.events.subscribe();

        let mut rx = h.poller.track(job);
        rx.wait_for(|j| j.is_terminal()).await.unwrap();

        assert_eq!(h.transport.fetches("j1"), 4);
        assert_eq!(rx.borrow().status, JobStatus::Completed);
        assert_eq!(rx.borrow().progress, 100);
        assert!(!h.poller.is_tracking(&JobId::new("j1")));
        assert!(h.ledger.get(&JobId::new("j1")).is_none());
        assert_eq!(h.timers.active_count(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.transport.fetches("j1"), 4);

        let seen = drain(&mut events);
        assert_eq!(count(&seen, "job.completed"), 1);
        assert_eq!(count(&seen, "job.progress"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_is_immediate() {
        let h = harness(PollerConfig::default().with_poll_interval(Duration::from_secs(60)));
        let _rx = h.poller.track(job("j1"));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.transport.fetches("j1"), 1);
        assert_eq!(h.poller.phase(&JobId::new("j1")), Some(PollPhase::Polling));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_terminal_confirmation_resumes_polling() {
        let h = default_harness();
        h.transport.script(
            "j1",
            vec![
                status(JobStatus::Completed, 100.0),
                status(JobStatus::Running, 50.0),
                status(JobStatus::Completed, 100.0),
                status(JobStatus::Completed, 100.0),
            ],
        );
        let mut events = h.events.subscribe();

        let mut rx = h.poller.track(job("j1"));
        rx.wait_for(|j| j.is_terminal()).await.unwrap();

        assert_eq!(h.transport.fetches("j1"), 4);
        let seen = drain(&mut events);
        assert_eq!(count(&seen, "job.completed"), 1);
        assert!(seen.iter().any(|e| matches!(
            e,
            JobEvent::Progress { status: JobStatus::Running, progress: 50, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_confirmation_uses_terminal_read() {
        let h = default_harness();
        h.transport.script(
            "j1",
            vec![
                Reply::Status(JobStatus::Failed, 30.0, vec!["embedding quota".into()]),
                Reply::Fail,
            ],
        );
        let mut events = h.events.subscribe();

        let mut rx = h.poller.track(job("j1"));
        rx.wait_for(|j| j.is_terminal()).await.unwrap();

        assert_eq!(h.transport.fetches("j1"), 2);
        assert_eq!(rx.borrow().status, JobStatus::Failed);
        let seen = drain(&mut events);
        assert_eq!(
            seen.last(),
            Some(&JobEvent::Failed {
                job_id: JobId::new("j1"),
                target: "postgresql".into(),
                errors: vec!["embedding quota".into()],
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_keep_polling() {
        let h = default_harness();
        h.transport.script(
            "j1",
            vec![
                Reply::Fail,
                Reply::Fail,
                status(JobStatus::PartiallyCompleted, 80.0),
                status(JobStatus::PartiallyCompleted, 80.0),
            ],
        );

        let mut rx = h.poller.track(job("j1"));
        rx.wait_for(|j| j.is_terminal()).await.unwrap();

        assert_eq!(h.transport.fetches("j1"), 4);
        assert_eq!(rx.borrow().status, JobStatus::PartiallyCompleted);
        assert_eq!(rx.borrow().progress, 80);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_never_regresses_while_running() {
        let h = default_harness();
        h.transport.script(
            "j1",
            vec![
                status(JobStatus::Running, 60.0),
                status(JobStatus::Running, 30.0),
            ],
        );

        let _rx = h.poller.track(job("j1"));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(h.transport.fetches("j1"), 2);
        let current = h.poller.job(&JobId::new("j1")).unwrap();
        assert_eq!(current.progress, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_expires_job() {
        let h = harness(PollerConfig::default().with_max_tracking(Duration::from_secs(5)));
        let job = job("j1");
        h.ledger.put(&job.ledger_entry()).unwrap();
        let mut events = h.events.subscribe();

        let _rx = h.poller.track(job);
        loop {
            if let JobEvent::Expired { job_id, .. } = events.recv().await.unwrap() {
                assert_eq!(job_id.as_str(), "j1");
                break;
            }
        }

        assert!(!h.poller.is_tracking(&JobId::new("j1")));
        assert!(h.ledger.get(&JobId::new("j1")).is_none());
        assert_eq!(h.timers.active_count(), 0);

        let fetched = h.transport.fetches("j1");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.transport.fetches("j1"), fetched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untrack_quiesces_as_cancelled() {
        let h = default_harness();
        let job = job("j1");
        h.ledger.put(&job.ledger_entry()).unwrap();
        let mut events = h.events.subscribe();

        let _rx = h.poller.track(job);
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(h.poller.untrack(&JobId::new("j1")));
        assert!(!h.poller.untrack(&JobId::new("j1")));
        assert!(h.ledger.get(&JobId::new("j1")).is_none());
        assert_eq!(h.timers.active_count(), 0);

        let fetched = h.transport.fetches("j1");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.transport.fetches("j1"), fetched);

        let seen = drain(&mut events);
        assert_eq!(count(&seen, "job.cancelled"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_is_idempotent() {
        let h = harness(PollerConfig::default().with_poll_interval(Duration::from_secs(60)));
        let _a = h.poller.track(job("j1"));
        let _b = h.poller.track(job("j1"));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.poller.tracked_count(), 1);
        assert_eq!(h.transport.fetches("j1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_now_fetches_out_of_cadence() {
        let h = harness(PollerConfig::default().with_poll_interval(Duration::from_secs(60)));
        let _a = h.poller.track(job("j1"));
        let _b = h.poller.track(job("j2"));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(h.poller.poll_now(&JobId::new("j1")));
        assert!(!h.poller.poll_now(&JobId::new("unknown")));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.transport.fetches("j1"), 2);
        assert_eq!(h.transport.fetches("j2"), 1);

        assert_eq!(h.poller.poll_all_now(), 2);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.transport.fetches("j1"), 3);
        assert_eq!(h.transport.fetches("j2"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_timers_and_keeps_ledger() {
        let h = default_harness();
        for id in ["j1", "j2"] {
            let job = job(id);
            h.ledger.put(&job.ledger_entry()).unwrap();
            let _ = h.poller.track(job);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.timers.active_count(), 2);

        h.poller.shutdown();
        assert_eq!(h.timers.active_count(), 0);
        assert_eq!(h.poller.tracked_count(), 0);
        assert_eq!(h.store.keys_with_prefix("cortex.job.").len(), 2);

        let fetched = h.transport.fetches("j1");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.transport.fetches("j1"), fetched);

        let _ = h.poller.track(job("j3"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.transport.fetches("j3"), 0);
        assert_eq!(h.timers.active_count(), 0);
    }
}
