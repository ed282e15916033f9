//! Service health gate. A failed or timed-out check records `outage`, and a
//! service with no record yet is not usable.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::HealthApi;
use crate::config::ClientConfig;
use crate::error::ApiError;

/// Backend services that expose a health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Content,
    Community,
    Notifications,
    Search,
    Wallet,
    Summary,
}

impl Service {
    pub const ALL: [Service; 6] = [
        Service::Content,
        Service::Community,
        Service::Notifications,
        Service::Search,
        Service::Wallet,
        Service::Summary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Community => "community",
            Self::Notifications => "notifications",
            Self::Search => "search",
            Self::Wallet => "wallet",
            Self::Summary => "summary",
        }
    }

    /// Position in [`Service::ALL`], used to stagger monitor start times.
    fn index(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or(0)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown service {0:?}")]
pub struct ParseServiceError(String);

impl FromStr for Service {
    type Err = ParseServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|service| service.as_str() == wanted)
            .ok_or_else(|| ParseServiceError(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Operational,
    Degraded,
    Outage,
    Maintenance,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operational => "operational",
            Self::Degraded => "degraded",
            Self::Outage => "outage",
            Self::Maintenance => "maintenance",
        }
    }

    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Operational)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Body of `GET /health/{service}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Last known health of one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealthRecord {
    pub service: Service,
    pub status: ServiceStatus,
    pub message: Option<String>,
    /// Server-provided timestamp, advisory only.
    pub timestamp: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ServiceHealthRecord {
    pub fn from_report(service: Service, report: HealthReport) -> Self {
        Self {
            service,
            status: report.status,
            message: report.message,
            timestamp: report.timestamp,
            checked_at: Utc::now(),
        }
    }

    pub fn outage(service: Service, error: &ApiError) -> Self {
        Self {
            service,
            status: ServiceStatus::Outage,
            message: Some(error.to_string()),
            timestamp: None,
            checked_at: Utc::now(),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.status.is_operational()
    }
}

pub type HealthSnapshot = BTreeMap<Service, ServiceHealthRecord>;

/// Fetch one health report, mapping every failure to `outage`.
pub async fn probe(api: &dyn HealthApi, service: Service, timeout: Duration) -> ServiceHealthRecord {
    let result = match tokio::time::timeout(timeout, api.fetch_health(service)).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Timeout),
    };

    match result {
        Ok(report) => ServiceHealthRecord::from_report(service, report),
        Err(e) => {
            tracing::warn!(service = %service, error = %e, "Health check failed, marking outage");
            ServiceHealthRecord::outage(service, &e)
        }
    }
}

/// UI affordances gated on backend health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Affordance {
    Search,
    /// The "おすすめ" recommendations control, backed by search.
    Recommendations,
    Notifications,
    Community,
    Wallet,
    Summary,
    ProblemEditing,
}

impl Affordance {
    pub fn required_services(&self) -> &'static [Service] {
        match self {
            Self::Search | Self::Recommendations => &[Service::Search],
            Self::Notifications => &[Service::Notifications],
            Self::Community => &[Service::Community],
            Self::Wallet => &[Service::Wallet],
            Self::Summary => &[Service::Summary],
            Self::ProblemEditing => &[Service::Content],
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthGateConfig {
    pub interval: Duration,
    pub request_timeout: Duration,
    /// Start offset between consecutive services. Zero disables staggering.
    pub stagger: Duration,
}

impl HealthGateConfig {
    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            interval: config.health_interval,
            request_timeout: config.request_timeout,
            stagger: config.health_stagger,
        }
    }

    fn start_offset(&self, service: Service) -> Duration {
        self.stagger * service.index() as u32
    }
}

impl Default for HealthGateConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(crate::config::DEFAULT_HEALTH_INTERVAL_SECS),
            request_timeout: Duration::from_secs(crate::config::DEFAULT_REQUEST_TIMEOUT_SECS),
            stagger: Duration::from_millis(crate::config::DEFAULT_HEALTH_STAGGER_MS),
        }
    }
}

#[derive(Default)]
struct Monitor {
    refs: usize,
    cancel: Option<CancellationToken>,
}

struct GateInner {
    api: Arc<dyn HealthApi>,
    config: HealthGateConfig,
    running: AtomicBool,
    records: watch::Sender<HealthSnapshot>,
    monitors: Mutex<HashMap<Service, Monitor>>,
}

impl GateInner {
    fn monitors(&self) -> MutexGuard<'_, HashMap<Service, Monitor>> {
        self.monitors.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, service: Service) {
        let mut monitors = self.monitors();
        let Some(monitor) = monitors.get_mut(&service) else {
            return;
        };
        monitor.refs = monitor.refs.saturating_sub(1);
        if monitor.refs == 0 {
            if let Some(cancel) = monitor.cancel.take() {
                cancel.cancel();
                tracing::debug!(service = %service, "Last subscriber gone, health monitor stopped");
            }
            monitors.remove(&service);
        }
    }
}

pub struct ServiceHealthGate {
    inner: Arc<GateInner>,
}

impl ServiceHealthGate {
    pub fn new(api: Arc<dyn HealthApi>, config: HealthGateConfig) -> Self {
        let (records, _) = watch::channel(HealthSnapshot::new());
        Self {
            inner: Arc::new(GateInner {
                api,
                config,
                running: AtomicBool::new(false),
                records,
                monitors: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Begin polling every service that already has subscribers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut monitors = self.inner.monitors();
        for (service, monitor) in monitors.iter_mut() {
            if monitor.refs > 0 && monitor.cancel.is_none() {
                monitor.cancel = Some(spawn_monitor(&self.inner, *service));
            }
        }
        tracing::info!(services = monitors.len(), "Service health gate started");
    }

    /// Cancel every monitor. Subscriber counts are kept so a later
    /// [`start`](Self::start) resumes polling for live subscriptions.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for monitor in self.inner.monitors().values_mut() {
            if let Some(cancel) = monitor.cancel.take() {
                cancel.cancel();
            }
        }
        tracing::info!("Service health gate stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Register interest in a service. Polling runs while at least one
    /// subscription is alive and the gate is started.
    pub fn subscribe(&self, service: Service) -> HealthSubscription {
        let mut monitors = self.inner.monitors();
        let monitor = monitors.entry(service).or_default();
        monitor.refs += 1;
        if monitor.cancel.is_none() && self.is_running() {
            monitor.cancel = Some(spawn_monitor(&self.inner, service));
        }
        HealthSubscription {
            inner: Arc::clone(&self.inner),
            service,
        }
    }

    /// Number of live subscriptions for a service.
    pub fn subscribers(&self, service: Service) -> usize {
        self.inner.monitors().get(&service).map_or(0, |m| m.refs)
    }

    pub fn record(&self, service: Service) -> Option<ServiceHealthRecord> {
        self.inner.records.borrow().get(&service).cloned()
    }

    pub fn status(&self, service: Service) -> Option<ServiceStatus> {
        self.inner.records.borrow().get(&service).map(|r| r.status)
    }

    pub fn is_usable(&self, service: Service) -> bool {
        self.status(service)
            .is_some_and(|status| status.is_operational())
    }

    /// True if any service with a known status is not operational.
    pub fn any_degraded(&self) -> bool {
        self.inner
            .records
            .borrow()
            .values()
            .any(|record| !record.is_usable())
    }

    pub fn is_enabled(&self, affordance: Affordance) -> bool {
        affordance
            .required_services()
            .iter()
            .all(|service| self.is_usable(*service))
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.inner.records.borrow().clone()
    }

    /// Receiver notified whenever a service's status changes.
    pub fn watch(&self) -> watch::Receiver<HealthSnapshot> {
        self.inner.records.subscribe()
    }
}

impl Drop for ServiceHealthGate {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Keeps a service's health monitor alive. Dropping releases it.
pub struct HealthSubscription {
    inner: Arc<GateInner>,
    service: Service,
}

impl HealthSubscription {
    pub fn service(&self) -> Service {
        self.service
    }
}

impl Drop for HealthSubscription {
    fn drop(&mut self) {
        self.inner.release(self.service);
    }
}

fn spawn_monitor(inner: &Arc<GateInner>, service: Service) -> CancellationToken {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        run_monitor(inner, service, task_cancel).await;
    });
    cancel
}

async fn run_monitor(inner: Arc<GateInner>, service: Service, cancel: CancellationToken) {
    let offset = inner.config.start_offset(service);
    tracing::debug!(
        service = %service,
        offset_ms = offset.as_millis() as u64,
        interval_secs = inner.config.interval.as_secs(),
        "Health monitor started"
    );

    if !offset.is_zero() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(offset) => {}
        }
    }

    let mut ticker = tokio::time::interval(inner.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            record = probe(inner.api.as_ref(), service, inner.config.request_timeout) => record,
        };

        // A monitor cancelled while its request was in flight must not write.
        if cancel.is_cancelled() {
            break;
        }

        inner.records.send_if_modified(|records| {
            let changed = records
                .get(&service)
                .map_or(true, |previous| previous.status != record.status);
            if changed {
                tracing::info!(service = %service, status = %record.status, "Service health changed");
            }
            records.insert(service, record);
            changed
        });
    }

    tracing::debug!(service = %service, "Health monitor exited");
}
