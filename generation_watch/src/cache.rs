//! Shared job status cache with in-flight request coalescing.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;

use crate::api::{validate_job_id, JobStatusApi};
use crate::error::ApiError;
use crate::GenerationJob;

type InFlight = Shared<BoxFuture<'static, Result<GenerationJob, ApiError>>>;

/// Retry policy for transient status failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: 2.0,
            // Attempts are bounded by count, not wall time.
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct CacheEntry {
    data: Option<GenerationJob>,
    error: Option<ApiError>,
    updated_at: Option<DateTime<Utc>>,
    observers: usize,
    in_flight: Option<InFlight>,
}

/// Last written state of a cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedStatus {
    pub data: Option<GenerationJob>,
    pub error: Option<ApiError>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct StatusCache {
    api: Arc<dyn JobStatusApi>,
    retry: RetryPolicy,
    entries: Arc<DashMap<String, CacheEntry>>,
}

impl StatusCache {
    pub fn new(api: Arc<dyn JobStatusApi>, retry: RetryPolicy) -> Self {
        Self {
            api,
            retry,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Read a job's status, joining the request in flight if there is one.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn fetch(&self, job_id: &str) -> Result<GenerationJob, ApiError> {
        let job_id = validate_job_id(job_id)?;

        let pending = {
            let mut entry = self.entries.entry(job_id.to_string()).or_default();
            if let Some(pending) = entry.in_flight.clone() {
                tracing::trace!(job_id, "Joining in-flight status request");
                pending
            } else {
                let pending = self.spawn_request(job_id.to_string());
                entry.in_flight = Some(pending.clone());
                pending
            }
        };

        pending.await
    }

    fn spawn_request(&self, job_id: String) -> InFlight {
        let api = Arc::clone(&self.api);
        let entries = Arc::clone(&self.entries);
        let retry = self.retry.clone();

        let handle = tokio::spawn(async move {
            let result = fetch_with_retry(api.as_ref(), &job_id, &retry).await;

            let mut unobserved = false;
            if let Some(mut entry) = entries.get_mut(&job_id) {
                entry.in_flight = None;
                unobserved = entry.observers == 0;
                if entry.observers > 0 {
                    match &result {
                        Ok(job) => {
                            entry.data = Some(job.clone());
                            entry.error = None;
                        }
                        Err(e) => entry.error = Some(e.clone()),
                    }
                    entry.updated_at = Some(Utc::now());
                } else {
                    tracing::debug!(job_id = %job_id, "No observers left, discarding status result");
                }
            }
            if unobserved {
                evict_if_unused(&entries, &job_id);
            }

            result
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(ApiError::Internal(e.to_string())))
        }
        .boxed()
        .shared()
    }

    /// Register an observer. Results are written back while any lease for
    /// the job is alive.
    pub fn observe(&self, job_id: &str) -> CacheLease {
        let key = cache_key(job_id);
        self.entries.entry(key.to_string()).or_default().observers += 1;
        CacheLease {
            entries: Arc::clone(&self.entries),
            job_id: key.to_string(),
        }
    }

    pub fn observers(&self, job_id: &str) -> usize {
        self.entries.get(cache_key(job_id)).map_or(0, |e| e.observers)
    }

    pub fn is_in_flight(&self, job_id: &str) -> bool {
        self.entries
            .get(cache_key(job_id))
            .is_some_and(|e| e.in_flight.is_some())
    }

    /// Number of jobs currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cached(&self, job_id: &str) -> Option<CachedStatus> {
        self.entries.get(cache_key(job_id)).map(|e| CachedStatus {
            data: e.data.clone(),
            error: e.error.clone(),
            updated_at: e.updated_at,
        })
    }

    /// Drop the stored observation so the next read goes to the server.
    pub fn invalidate(&self, job_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(cache_key(job_id)) {
            entry.data = None;
            entry.error = None;
            entry.updated_at = None;
        }
    }

    /// Confirm the extracted structure and invalidate the cached status.
    pub async fn confirm_structure(
        &self,
        job_id: &str,
        structure: Option<Value>,
    ) -> Result<Value, ApiError> {
        let job_id = validate_job_id(job_id)?;
        let ack = self.api.confirm_structure(job_id, structure).await?;
        self.invalidate(job_id);
        tracing::info!(job_id, "Structure confirmed");
        Ok(ack)
    }
}

/// Observer registration for one job. Dropping it releases the job.
pub struct CacheLease {
    entries: Arc<DashMap<String, CacheEntry>>,
    job_id: String,
}

impl CacheLease {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entries.get_mut(&self.job_id) {
            entry.observers = entry.observers.saturating_sub(1);
        }
        evict_if_unused(&self.entries, &self.job_id);
    }
}

/// Job ids are matched after trimming, the same way [`validate_job_id`] does.
fn cache_key(job_id: &str) -> &str {
    job_id.trim()
}

fn evict_if_unused(entries: &DashMap<String, CacheEntry>, job_id: &str) {
    let evicted = entries.remove_if(job_id, |_, entry| {
        entry.observers == 0 && entry.in_flight.is_none()
    });
    if evicted.is_some() {
        tracing::trace!(job_id, "Evicted unobserved status entry");
    }
}

async fn fetch_with_retry(
    api: &dyn JobStatusApi,
    job_id: &str,
    retry: &RetryPolicy,
) -> Result<GenerationJob, ApiError> {
    let max_retries = retry.max_retries;
    let mut attempt: u32 = 0;

    backoff::future::retry(retry.backoff(), || {
        attempt += 1;
        let current = attempt;
        async move {
            api.fetch_status(job_id).await.map_err(|e| {
                if e.is_transient() && current <= max_retries {
                    tracing::debug!(job_id, attempt = current, error = %e, "Retrying status request");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}
