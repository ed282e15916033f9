//! Follows one generation job at a time and publishes its status through a
//! `watch` channel. Results from a replaced or cancelled session are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheLease, StatusCache};
use crate::error::ApiError;
use crate::phase_gate::{PhaseGate, PollDecision, StopReason};
use crate::GenerationJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PollerState {
    /// No job, or polling disabled.
    Idle,
    Polling,
    Stopped { reason: StopReason },
}

impl PollerState {
    pub fn is_polling(&self) -> bool {
        matches!(self, Self::Polling)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }
}

/// The server reported an earlier phase than previously observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseRegression {
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusSnapshot {
    pub job_id: Option<String>,
    pub data: Option<GenerationJob>,
    pub is_loading: bool,
    pub error: Option<ApiError>,
    pub state: PollerState,
    pub anomaly: Option<PhaseRegression>,
    session: u64,
}

impl JobStatusSnapshot {
    fn idle(session: u64) -> Self {
        Self {
            job_id: None,
            data: None,
            is_loading: false,
            error: None,
            state: PollerState::Idle,
            anomaly: None,
            session,
        }
    }

    pub fn phase(&self) -> Option<i64> {
        self.data.as_ref().map(|job| job.phase)
    }

    /// Record a fetch outcome. Returns the regression detected, if any.
    fn apply(&mut self, result: Result<GenerationJob, ApiError>) -> Option<PhaseRegression> {
        self.is_loading = false;
        match result {
            Ok(job) => {
                let regression = self
                    .data
                    .as_ref()
                    .filter(|previous| job.phase < previous.phase)
                    .map(|previous| PhaseRegression {
                        from: previous.phase,
                        to: job.phase,
                    });
                if regression.is_some() {
                    self.anomaly = regression;
                }
                self.data = Some(job);
                self.error = None;
                regression
            }
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerOptions {
    /// Keep the last observation visible when polling is disabled for the
    /// same job. Switching to another job always clears it.
    pub retain_when_dormant: bool,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            retain_when_dormant: true,
        }
    }
}

struct Session {
    id: u64,
    job_id: String,
    cancel: CancellationToken,
    // Released as soon as the session is replaced so late results are not
    // written into the shared cache.
    _lease: CacheLease,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct JobStatusPoller {
    cache: Arc<StatusCache>,
    gate: PhaseGate,
    options: PollerOptions,
    snapshot_tx: watch::Sender<JobStatusSnapshot>,
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
}

impl JobStatusPoller {
    pub fn new(cache: Arc<StatusCache>, gate: PhaseGate) -> Self {
        Self::with_options(cache, gate, PollerOptions::default())
    }

    pub fn with_options(cache: Arc<StatusCache>, gate: PhaseGate, options: PollerOptions) -> Self {
        let (snapshot_tx, _) = watch::channel(JobStatusSnapshot::idle(0));
        Self {
            cache,
            gate,
            options,
            snapshot_tx,
            session: Mutex::new(None),
            next_session: AtomicU64::new(1),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Point the poller at a job. Polling runs only for `Some(id)` with
    /// `enabled`; re-sending the active target is a no-op.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn set_target(&self, job_id: Option<&str>, enabled: bool) {
        let job_id = job_id.map(str::trim).filter(|id| !id.is_empty());
        let mut session = self.lock_session();

        match (job_id, enabled) {
            (Some(id), true) => {
                if session.as_ref().is_some_and(|s| s.job_id == id) {
                    return;
                }
                // Cancel and release the old session before starting the new one.
                session.take();
                *session = Some(self.start_session(id));
            }
            _ => {
                session.take();
                self.go_idle(job_id);
            }
        }
    }

    /// Restart polling for the current job after the gate stopped it,
    /// e.g. once the user confirmed the extracted structure.
    pub fn resume(&self) {
        let mut session = self.lock_session();
        let Some(job_id) = session.as_ref().map(|s| s.job_id.clone()) else {
            return;
        };
        if !self.snapshot_tx.borrow().state.is_stopped() {
            return;
        }
        session.take();
        tracing::debug!(job_id = %job_id, "Resuming status polling");
        *session = Some(self.start_session(&job_id));
    }

    /// Stop polling and return to idle.
    pub fn cancel(&self) {
        self.set_target(None, false);
    }

    pub fn snapshot(&self) -> JobStatusSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobStatusSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn gate(&self) -> &PhaseGate {
        &self.gate
    }

    fn allocate_session(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    fn go_idle(&self, job_id: Option<&str>) {
        let id = self.allocate_session();
        let retain = self.options.retain_when_dormant;
        self.snapshot_tx.send_modify(|snapshot| {
            let same_job = job_id.is_some() && snapshot.job_id.as_deref() == job_id;
            if retain && same_job {
                snapshot.session = id;
                snapshot.is_loading = false;
                snapshot.state = PollerState::Idle;
            } else {
                let mut idle = JobStatusSnapshot::idle(id);
                idle.job_id = job_id.map(str::to_string);
                *snapshot = idle;
            }
        });
    }

    fn start_session(&self, job_id: &str) -> Session {
        let id = self.allocate_session();
        let cached = self.cache.cached(job_id);

        self.snapshot_tx.send_modify(|snapshot| {
            let same_job = snapshot.job_id.as_deref() == Some(job_id);
            let seeded = cached.as_ref().and_then(|c| c.data.clone());
            let data = match seeded {
                Some(data) => Some(data),
                None if same_job => snapshot.data.take(),
                None => None,
            };
            *snapshot = JobStatusSnapshot {
                job_id: Some(job_id.to_string()),
                data,
                is_loading: true,
                error: None,
                state: PollerState::Polling,
                anomaly: None,
                session: id,
            };
        });

        let lease = self.cache.observe(job_id);
        let cancel = CancellationToken::new();

        tracing::debug!(job_id, session = id, "Status polling started");
        tokio::spawn(run_session(SessionTask {
            id,
            job_id: job_id.to_string(),
            cache: Arc::clone(&self.cache),
            gate: self.gate,
            snapshot_tx: self.snapshot_tx.clone(),
            cancel: cancel.clone(),
        }));

        Session {
            id,
            job_id: job_id.to_string(),
            cancel,
            _lease: lease,
        }
    }

    /// Id of the active session, if any.
    pub fn session_id(&self) -> Option<u64> {
        self.lock_session().as_ref().map(|s| s.id)
    }
}

impl Drop for JobStatusPoller {
    fn drop(&mut self) {
        self.lock_session().take();
    }
}

struct SessionTask {
    id: u64,
    job_id: String,
    cache: Arc<StatusCache>,
    gate: PhaseGate,
    snapshot_tx: watch::Sender<JobStatusSnapshot>,
    cancel: CancellationToken,
}

async fn run_session(task: SessionTask) {
    let SessionTask {
        id,
        job_id,
        cache,
        gate,
        snapshot_tx,
        cancel,
    } = task;

    // Seeded data may predate a confirmation; stop decisions need a fresh read.
    let mut fetched_this_session = false;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = cache.fetch(&job_id) => result,
        };

        if let Err(e) = &result {
            tracing::warn!(job_id = %job_id, error = %e, "Status fetch failed");
        }

        fetched_this_session |= result.is_ok();
        let mut decision = None;
        snapshot_tx.send_if_modified(|snapshot| {
            if snapshot.session != id || cancel.is_cancelled() {
                return false;
            }
            if let Some(regression) = snapshot.apply(result) {
                tracing::warn!(
                    job_id = %job_id,
                    from = regression.from,
                    to = regression.to,
                    "Job phase went backwards"
                );
            }
            let observed = snapshot.data.as_ref().filter(|_| fetched_this_session);
            let next = gate.decide(observed);
            if let PollDecision::Stop(reason) = next {
                snapshot.state = PollerState::Stopped { reason };
            }
            decision = Some(next);
            true
        });

        let Some(decision) = decision else {
            tracing::debug!(job_id = %job_id, session = id, "Discarding result of cancelled session");
            break;
        };

        let delay = match decision {
            PollDecision::Stop(reason) => {
                tracing::info!(job_id = %job_id, %reason, "Status polling stopped");
                break;
            }
            PollDecision::PollAfter(delay) => delay,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let still_active = snapshot_tx.send_if_modified(|snapshot| {
            if snapshot.session != id || cancel.is_cancelled() {
                return false;
            }
            snapshot.is_loading = true;
            true
        });
        if !still_active {
            break;
        }
    }

    tracing::trace!(job_id = %job_id, session = id, "Status session exited");
}
