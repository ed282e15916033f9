use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use futures::stream::{self, StreamExt};
use generation_watch::api::ApiClient;
use generation_watch::cache::StatusCache;
use generation_watch::config::ClientConfig;
use generation_watch::health::{
    probe, Affordance, HealthGateConfig, HealthSnapshot, Service, ServiceHealthGate,
    ServiceHealthRecord,
};
use generation_watch::phase_gate::PhaseGate;
use generation_watch::poller::{JobStatusPoller, JobStatusSnapshot, PollerState};
use generation_watch::problem::summarize_payload;
use generation_watch::{logging, utils, ApiError};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(author, version, about = "Follow generation jobs and backend service health", long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll a generation job until it waits for the user or finishes
    Watch {
        job_id: String,

        /// Write the final status snapshot to this JSON file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Confirm the extracted structure of a job waiting in phase 3
    Confirm {
        job_id: String,

        /// JSON file with the (edited) structure data to submit
        #[arg(short, long)]
        structure: Option<PathBuf>,

        /// Keep watching the job after confirming
        #[arg(short, long)]
        watch: bool,
    },

    /// Check backend service health
    Health {
        /// Service to check (repeatable). Defaults to every service.
        #[arg(short, long = "service")]
        services: Vec<Service>,

        /// Keep monitoring and print status changes until Ctrl-C
        #[arg(short, long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();
    logging::init_logging(args.verbose);

    let config = ClientConfig::from_env().context("invalid configuration")?;
    let api = Arc::new(ApiClient::new(&config).context("failed to build HTTP client")?);
    tracing::debug!(base_url = %api.base_url(), "Client configured");

    match args.command {
        Command::Watch { job_id, output } => {
            let cache = Arc::new(StatusCache::new(api, config.retry.clone()));
            watch_job(cache, &config, &job_id, output.as_deref()).await
        }
        Command::Confirm {
            job_id,
            structure,
            watch,
        } => {
            let structure = structure
                .as_deref()
                .map(utils::load_json)
                .transpose()
                .context("failed to read structure file")?;
            let cache = Arc::new(StatusCache::new(api, config.retry.clone()));
            let ack = cache
                .confirm_structure(&job_id, structure)
                .await
                .context("structure confirmation failed")?;
            println!("✅ Structure confirmed for {}", job_id);
            if !ack.is_null() {
                println!("{}", serde_json::to_string_pretty(&ack)?);
            }
            if watch {
                watch_job(cache, &config, &job_id, None).await?;
            }
            Ok(())
        }
        Command::Health { services, watch } => {
            let services = if services.is_empty() {
                Service::ALL.to_vec()
            } else {
                services
            };
            if watch {
                monitor_health(api, &config, &services).await
            } else {
                check_health(api, &config, &services).await
            }
        }
    }
}

async fn watch_job(
    cache: Arc<StatusCache>,
    config: &ClientConfig,
    job_id: &str,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let poller = JobStatusPoller::new(cache, PhaseGate::new(config.poll_interval));
    let mut rx = poller.subscribe();
    poller.set_target(Some(job_id), true);
    println!("🔍 Watching job {}", job_id);

    let mut last_phase = None;
    let mut last_error = None;

    let last = loop {
        let snapshot = rx.borrow_and_update().clone();

        if snapshot.phase() != last_phase {
            last_phase = snapshot.phase();
            if let Some(job) = &snapshot.data {
                println!("   phase {}", job.phase);
            }
        }
        if let Some(anomaly) = snapshot.anomaly {
            tracing::debug!(from = anomaly.from, to = anomaly.to, "Phase regression observed");
        }
        if snapshot.error != last_error {
            if let Some(e) = &snapshot.error {
                if *e == ApiError::Unauthorized {
                    bail!("the API rejected the bearer token; check GENERATION_API_TOKEN");
                }
                eprintln!("⚠️ {} (retrying)", e);
            }
            last_error = snapshot.error.clone();
        }
        if let PollerState::Stopped { reason } = snapshot.state {
            println!("✅ Job {}: {}", job_id, reason);
            break snapshot;
        }

        tokio::select! {
            changed = rx.changed() => changed.context("poller closed")?,
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted");
                poller.cancel();
                break snapshot;
            }
        }
    };

    if let Some(summary) = last
        .data
        .as_ref()
        .and_then(|job| job.payload.as_ref())
        .and_then(summarize_payload)
    {
        println!("   generated: {}", summary);
    }

    if let Some(path) = output {
        utils::save_json(&snapshot_json(&last), path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("✅ {} written", path.display());
    }
    Ok(())
}

fn snapshot_json(snapshot: &JobStatusSnapshot) -> serde_json::Value {
    json!({
        "jobId": snapshot.job_id,
        "state": snapshot.state,
        "job": snapshot.data,
        "error": snapshot.error.as_ref().map(|e| e.to_string()),
        "anomaly": snapshot.anomaly,
    })
}

async fn check_health(
    api: Arc<ApiClient>,
    config: &ClientConfig,
    services: &[Service],
) -> anyhow::Result<()> {
    let mut records: Vec<ServiceHealthRecord> = stream::iter(services.iter().copied())
        .map(|service| probe(api.as_ref(), service, config.request_timeout))
        .buffer_unordered(services.len().max(1))
        .collect()
        .await;
    records.sort_by_key(|record| record.service);

    let snapshot: HealthSnapshot = records.into_iter().map(|r| (r.service, r)).collect();
    print_health(&snapshot);

    if snapshot.values().any(|record| !record.is_usable()) {
        std::process::exit(2);
    }
    Ok(())
}

async fn monitor_health(
    api: Arc<ApiClient>,
    config: &ClientConfig,
    services: &[Service],
) -> anyhow::Result<()> {
    let gate = ServiceHealthGate::new(api, HealthGateConfig::from_client_config(config));
    let mut rx = gate.watch();
    let subscriptions: Vec<_> = services.iter().map(|s| gate.subscribe(*s)).collect();
    gate.start();

    loop {
        tokio::select! {
            changed = rx.changed() => {
                changed.context("health gate closed")?;
                let snapshot = rx.borrow_and_update().clone();
                print_health(&snapshot);
                let recommendations = if gate.is_enabled(Affordance::Recommendations) {
                    "enabled"
                } else {
                    "disabled"
                };
                println!("   おすすめ (recommendations): {}", recommendations);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(subscriptions);
    gate.stop();
    Ok(())
}

fn print_health(snapshot: &HealthSnapshot) {
    for record in snapshot.values() {
        let marker = if record.is_usable() { "✅" } else { "❌" };
        println!(
            "{} {:<14} {:<12} {}",
            marker,
            record.service,
            record.status,
            record.message.as_deref().unwrap_or("")
        );
    }
}
