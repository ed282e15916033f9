use std::time::Duration;

use serde::Serialize;

use crate::GenerationJob;

/// Structure extracted and confirmed, waiting for the user to continue.
pub const STRUCTURE_CONFIRMED: i64 = 3;

/// Content generated, waiting for the user to review.
pub const GENERATION_CONFIRMED: i64 = 13;

/// Publication started. This and every later phase is final.
pub const PUBLICATION_PUBLISHING: i64 = 21;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Returns true if the server will not advance the job without user action.
pub fn is_awaiting_user(phase: i64) -> bool {
    phase == STRUCTURE_CONFIRMED || phase == GENERATION_CONFIRMED
}

/// Returns true for the publication phase and beyond.
pub fn is_terminal(phase: i64) -> bool {
    phase >= PUBLICATION_PUBLISHING
}

/// Why a polling session ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    AwaitingUser { phase: i64 },
    Terminal { phase: i64 },
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingUser { phase } => write!(f, "awaiting user (phase {})", phase),
            Self::Terminal { phase } => write!(f, "finished (phase {})", phase),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    PollAfter(Duration),
    Stop(StopReason),
}

impl PollDecision {
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseGate {
    interval: Duration,
}

impl PhaseGate {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Decide whether to fetch again. Rules are checked in order:
    /// no data yet, awaiting user, terminal, otherwise poll.
    pub fn decide(&self, data: Option<&GenerationJob>) -> PollDecision {
        let Some(job) = data else {
            return PollDecision::PollAfter(self.interval);
        };

        if is_awaiting_user(job.phase) {
            PollDecision::Stop(StopReason::AwaitingUser { phase: job.phase })
        } else if is_terminal(job.phase) {
            PollDecision::Stop(StopReason::Terminal { phase: job.phase })
        } else {
            PollDecision::PollAfter(self.interval)
        }
    }
}

impl Default for PhaseGate {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

/// [`PhaseGate::decide`] with the default interval.
pub fn decide(data: Option<&GenerationJob>) -> PollDecision {
    PhaseGate::default().decide(data)
}
