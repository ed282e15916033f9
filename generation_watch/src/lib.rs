pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod phase_gate;
pub mod poller;
pub mod problem;
pub mod utils;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use error::{ApiError, ConfigError};

/// Snapshot of a server-side generation job as returned by the status endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJob {
    pub job_id: String,
    pub phase: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl GenerationJob {
    pub fn new(job_id: impl Into<String>, phase: i64) -> Self {
        Self {
            job_id: job_id.into(),
            phase,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_awaiting_user(&self) -> bool {
        phase_gate::is_awaiting_user(self.phase)
    }

    pub fn is_terminal(&self) -> bool {
        phase_gate::is_terminal(self.phase)
    }
}
