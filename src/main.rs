use std::sync::Arc;

use sms_relay::api::{AppState, api_routes};
use sms_relay::backend::HttpBackendClient;
use sms_relay::config::RelayConfig;
use sms_relay::jobs::{
    ConnectivityGate, JobQueue, JobRunner, RunnerConfig, spawn_probe_task, spawn_runner_task,
};
use sms_relay::pipeline::{ForwardStage, IntakeStage, RelayGateway};
use sms_relay::store::{Database, RecordStore, RuleStore, SettingsStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env()?;

    eprintln!("📨 SMS Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   API:      http://{}/api", config.bind_addr);
    eprintln!(
        "   Backend:  {}s timeout, {} concurrent jobs",
        config.http_timeout.as_secs(),
        config.max_concurrent_jobs
    );

    // ── Database & stores ────────────────────────────────────────────
    let db_path = std::path::Path::new(&config.db_path);
    let db = Arc::new(Database::new_local(db_path).await.unwrap_or_else(|e| {
        eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
        std::process::exit(1);
    }));

    let rules = Arc::new(RuleStore::new(Arc::clone(&db)));
    let records = Arc::new(RecordStore::new(Arc::clone(&db)).await?);
    let settings = Arc::new(SettingsStore::new(Arc::clone(&db)).await?);
    let queue = Arc::new(JobQueue::new(Arc::clone(&db)));

    // ── Startup recovery: reclaim jobs stranded by a crash ───────────
    let recovered = queue.requeue_stale().await?;
    if recovered > 0 {
        eprintln!("   Recovered {} interrupted jobs", recovered);
    }

    // ── Connectivity gate ────────────────────────────────────────────
    let gate = match &config.probe_addr {
        Some(addr) => {
            eprintln!(
                "   Probe:    {} every {}s",
                addr,
                config.probe_interval.as_secs()
            );
            let gate = Arc::new(ConnectivityGate::new(false));
            let _probe_handle =
                spawn_probe_task(Arc::clone(&gate), addr.clone(), config.probe_interval);
            gate
        }
        None => Arc::new(ConnectivityGate::assume_online()),
    };

    // ── Pipeline stages & runner ─────────────────────────────────────
    let backend = Arc::new(HttpBackendClient::new(config.http_timeout));
    let gateway = Arc::new(RelayGateway::new(Arc::clone(&queue)));

    let runner_config = RunnerConfig {
        poll_interval: config.poll_interval,
        retry_base: config.retry_base,
        retry_cap: config.retry_cap,
        max_concurrent: config.max_concurrent_jobs,
    };
    let mut runner = JobRunner::new(Arc::clone(&queue), Arc::clone(&gate), runner_config);
    runner.register(Arc::new(IntakeStage::new(
        Arc::clone(&rules),
        Arc::clone(&records),
        Arc::clone(&queue),
    )));
    runner.register(Arc::new(ForwardStage::new(
        Arc::clone(&records),
        Arc::clone(&settings),
        backend,
    )));
    let _runner_handle = spawn_runner_task(Arc::new(runner));

    // ── HTTP API ─────────────────────────────────────────────────────
    let state = AppState {
        gateway,
        rules,
        records,
        settings,
        queue,
    };
    let app = api_routes(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "SMS relay listening");
    axum::serve(listener, app).await?;

    Ok(())
}
