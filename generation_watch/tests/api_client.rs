use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use generation_watch::api::{ApiClient, HealthApi, JobStatusApi};
use generation_watch::cache::{RetryPolicy, StatusCache};
use generation_watch::config::ClientConfig;
use generation_watch::health::{probe, Service, ServiceStatus};
use generation_watch::phase_gate::{PhaseGate, StopReason};
use generation_watch::poller::{JobStatusPoller, PollerState};
use generation_watch::ApiError;

const TOKEN: &str = "test-token";

/// In-process stand-in for the generation backend.
#[derive(Default)]
struct Backend {
    /// Phases served per job, one per request. The last phase repeats.
    phases: DashMap<String, Vec<i64>>,
    confirmations: Mutex<Vec<(String, String)>>,
}

type Shared = Arc<Backend>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", TOKEN))
        .unwrap_or(false)
}

async fn job_status(
    State(backend): State<Shared>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if job_id == "garbled" {
        return (StatusCode::OK, "definitely not json").into_response();
    }
    let Some(mut phases) = backend.phases.get_mut(&job_id) else {
        return (StatusCode::NOT_FOUND, "job not found").into_response();
    };
    let phase = if phases.len() > 1 {
        phases.remove(0)
    } else {
        phases.first().copied().unwrap_or_default()
    };

    let mut body = json!({ "jobId": job_id, "phase": phase });
    if phase >= 21 {
        body["payload"] = json!({ "problems": [{ "problemType": 1 }, { "problemType": 4 }] });
    }
    Json(body).into_response()
}

async fn confirm(
    State(backend): State<Shared>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    backend
        .confirmations
        .lock()
        .unwrap()
        .push((job_id.clone(), body));
    if job_id == "quiet" {
        return StatusCode::NO_CONTENT.into_response();
    }
    Json(json!({ "accepted": true })).into_response()
}

async fn health(Path(service): Path<String>) -> Response {
    match service.as_str() {
        "search" => (StatusCode::SERVICE_UNAVAILABLE, "maintenance window").into_response(),
        "wallet" => Json(json!({ "status": "degraded", "message": "slow ledger" })).into_response(),
        _ => Json(json!({ "status": "operational", "timestamp": "2026-10-16T00:00:00Z" }))
            .into_response(),
    }
}

async fn spawn_backend(backend: Shared) -> SocketAddr {
    let app = Router::new()
        .route("/api/generation/jobs/{job_id}/status", get(job_status))
        .route("/api/generation/jobs/{job_id}/confirm", post(confirm))
        .route("/api/health/{service}", get(health))
        .with_state(backend);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn config(addr: SocketAddr, token: Option<&str>) -> ClientConfig {
    let base = format!("http://{}/api", addr);
    let token = token.map(str::to_string);
    ClientConfig::from_lookup(move |key| match key {
        "GENERATION_API_URL" => Some(base.clone()),
        "GENERATION_API_TOKEN" => token.clone(),
        "GENERATION_REQUEST_TIMEOUT_SECS" => Some("5".to_string()),
        _ => None,
    })
    .unwrap()
}

fn client(addr: SocketAddr) -> ApiClient {
    ApiClient::new(&config(addr, Some(TOKEN))).unwrap()
}

fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[tokio::test]
async fn test_fetch_status() {
    let backend = Shared::default();
    let job_id = new_job_id();
    backend.phases.insert(job_id.clone(), vec![7]);
    let addr = spawn_backend(backend).await;

    let job = client(addr).fetch_status(&job_id).await.unwrap();
    assert_eq!(job.job_id, job_id);
    assert_eq!(job.phase, 7);
    assert_eq!(job.payload, None);
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let backend = Shared::default();
    backend.phases.insert("j1".to_string(), vec![1]);
    let addr = spawn_backend(backend).await;

    let api = ApiClient::new(&config(addr, None)).unwrap();
    assert_eq!(api.fetch_status("j1").await, Err(ApiError::Unauthorized));
    assert_eq!(
        api.confirm_structure("j1", None).await,
        Err(ApiError::Unauthorized)
    );
}

#[tokio::test]
async fn test_unknown_job_maps_to_status_error() {
    let addr = spawn_backend(Shared::default()).await;

    let err = client(addr).fetch_status("nope").await.unwrap_err();
    assert_eq!(
        err,
        ApiError::Status {
            status: 404,
            message: "job not found".to_string(),
        }
    );
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_malformed_body_is_decode_error() {
    let addr = spawn_backend(Shared::default()).await;

    let err = client(addr).fetch_status("garbled").await.unwrap_err();
    assert!(matches!(err, ApiError::Decode(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_confirm_sends_structure_data() {
    let backend = Shared::default();
    let addr = spawn_backend(backend.clone()).await;
    let api = client(addr);

    let ack = api
        .confirm_structure("j1", Some(json!({ "chapters": ["intro"] })))
        .await
        .unwrap();
    assert_eq!(ack, json!({ "accepted": true }));

    let empty = api.confirm_structure("quiet", None).await.unwrap();
    assert_eq!(empty, Value::Null);

    let confirmations = backend.confirmations.lock().unwrap().clone();
    assert_eq!(confirmations.len(), 2);
    let (job_id, body) = &confirmations[0];
    assert_eq!(job_id, "j1");
    let body: Value = serde_json::from_str(body).unwrap();
    assert_eq!(body, json!({ "structureData": { "chapters": ["intro"] } }));
    assert_eq!(confirmations[1], ("quiet".to_string(), String::new()));
}

#[tokio::test]
async fn test_health_reports() {
    let addr = spawn_backend(Shared::default()).await;
    let api = client(addr);

    let report = api.fetch_health(Service::Content).await.unwrap();
    assert_eq!(report.status, ServiceStatus::Operational);
    assert_eq!(report.timestamp.as_deref(), Some("2026-10-16T00:00:00Z"));

    let report = api.fetch_health(Service::Wallet).await.unwrap();
    assert_eq!(report.status, ServiceStatus::Degraded);
    assert_eq!(report.message.as_deref(), Some("slow ledger"));

    let err = api.fetch_health(Service::Search).await.unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 503, .. }));
}

#[tokio::test]
async fn test_probe_marks_unavailable_service_as_outage() {
    let addr = spawn_backend(Shared::default()).await;
    let api = client(addr);

    let record = probe(&api, Service::Search, Duration::from_secs(5)).await;
    assert_eq!(record.status, ServiceStatus::Outage);
    assert!(!record.is_usable());
    assert!(record
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("maintenance window"));

    let record = probe(&api, Service::Summary, Duration::from_secs(5)).await;
    assert!(record.is_usable());
}

#[tokio::test]
async fn test_poller_follows_job_to_awaiting_user() {
    let backend = Shared::default();
    let job_id = new_job_id();
    backend.phases.insert(job_id.clone(), vec![1, 2, 3, 4]);
    let addr = spawn_backend(backend).await;

    let cache = Arc::new(StatusCache::new(Arc::new(client(addr)), RetryPolicy::none()));
    let poller = JobStatusPoller::new(cache, PhaseGate::new(Duration::from_millis(10)));
    let mut rx = poller.subscribe();
    poller.set_target(Some(&job_id), true);

    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.state.is_stopped()),
    )
    .await
    .expect("poller did not stop")
    .unwrap()
    .clone();

    assert_eq!(snapshot.phase(), Some(3));
    assert_eq!(
        snapshot.state,
        PollerState::Stopped {
            reason: StopReason::AwaitingUser { phase: 3 }
        }
    );
    assert_eq!(snapshot.error, None);
}

#[tokio::test]
async fn test_poller_stops_on_terminal_phase() {
    let backend = Shared::default();
    let job_id = new_job_id();
    backend.phases.insert(job_id.clone(), vec![14, 20, 21]);
    let addr = spawn_backend(backend).await;

    let cache = Arc::new(StatusCache::new(Arc::new(client(addr)), RetryPolicy::none()));
    let poller = JobStatusPoller::new(cache, PhaseGate::new(Duration::from_millis(10)));
    let mut rx = poller.subscribe();
    poller.set_target(Some(&job_id), true);

    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.state.is_stopped()),
    )
    .await
    .expect("poller did not stop")
    .unwrap()
    .clone();

    assert_eq!(
        snapshot.state,
        PollerState::Stopped {
            reason: StopReason::Terminal { phase: 21 }
        }
    );
    let payload = snapshot.data.and_then(|job| job.payload).unwrap();
    assert_eq!(payload["problems"].as_array().map(Vec::len), Some(2));
}
