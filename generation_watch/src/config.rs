//! Client configuration loaded from the environment.

use std::env;
use std::time::Duration;

use url::Url;

use crate::cache::RetryPolicy;
use crate::error::ConfigError;
use crate::phase_gate::DEFAULT_POLL_INTERVAL;

pub const DEFAULT_API_URL: &str = "http://localhost:8080/api/";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEALTH_STAGGER_MS: u64 = 250;

const KEY_API_URL: &str = "GENERATION_API_URL";
const KEY_API_TOKEN: &str = "GENERATION_API_TOKEN";
const KEY_REQUEST_TIMEOUT: &str = "GENERATION_REQUEST_TIMEOUT_SECS";
const KEY_POLL_INTERVAL: &str = "GENERATION_POLL_INTERVAL_MS";
const KEY_FETCH_RETRIES: &str = "GENERATION_FETCH_RETRIES";
const KEY_HEALTH_INTERVAL: &str = "HEALTH_POLL_INTERVAL_SECS";
const KEY_HEALTH_STAGGER: &str = "HEALTH_STAGGER_MS";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL all endpoint paths are appended to.
    pub api_base_url: Url,

    /// Bearer token attached to every request.
    pub bearer_token: Option<String>,

    pub request_timeout: Duration,

    /// Interval between status polls while a job is progressing.
    pub poll_interval: Duration,

    pub retry: RetryPolicy,

    pub health_interval: Duration,

    /// Start offset between consecutive service monitors.
    pub health_stagger: Duration,
}

impl ClientConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_url = lookup(KEY_API_URL).unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let api_base_url = parse_base_url(&raw_url)?;

        let bearer_token = lookup(KEY_API_TOKEN)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let request_timeout = Duration::from_secs(parse_u64(
            &lookup,
            KEY_REQUEST_TIMEOUT,
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?);
        let poll_interval = Duration::from_millis(parse_u64(
            &lookup,
            KEY_POLL_INTERVAL,
            DEFAULT_POLL_INTERVAL.as_millis() as u64,
        )?);
        let max_retries = parse_u64(
            &lookup,
            KEY_FETCH_RETRIES,
            RetryPolicy::default().max_retries as u64,
        )?;
        let health_interval = Duration::from_secs(parse_u64(
            &lookup,
            KEY_HEALTH_INTERVAL,
            DEFAULT_HEALTH_INTERVAL_SECS,
        )?);
        let health_stagger = Duration::from_millis(parse_u64(
            &lookup,
            KEY_HEALTH_STAGGER,
            DEFAULT_HEALTH_STAGGER_MS,
        )?);

        for (key, value) in [
            (KEY_REQUEST_TIMEOUT, request_timeout),
            (KEY_POLL_INTERVAL, poll_interval),
            (KEY_HEALTH_INTERVAL, health_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    key,
                    value: "0".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        let max_retries = u32::try_from(max_retries).map_err(|e| ConfigError::Invalid {
            key: KEY_FETCH_RETRIES,
            value: max_retries.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            api_base_url,
            bearer_token,
            request_timeout,
            poll_interval,
            retry: RetryPolicy {
                max_retries,
                ..RetryPolicy::default()
            },
            health_interval,
            health_stagger,
        })
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidUrl {
        value: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidUrl {
            value: raw.to_string(),
            reason: "URL cannot be used as a base".to_string(),
        });
    }
    // Endpoint paths are appended as segments, so normalise to a trailing slash.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn parse_u64<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}
