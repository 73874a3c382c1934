use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::info;

use crate::core::alerts::{AlertEvaluator, Dispatcher};
use crate::core::config::HivewatchConfig;
use crate::core::ingest::IngestPipeline;
use crate::core::lifecycle::{BackgroundJobs, BackgroundWorkers, LifecycleManager};
use crate::core::live::LiveHub;
use crate::core::store::EventStore;
use crate::core::terminal;
use crate::interfaces::web::{ApiServer, AppState};

pub async fn run_server(config: HivewatchConfig) -> Result<()> {
    terminal::print_banner();

    let db_path = config.database_path();
    let store = EventStore::open(
        &db_path,
        config.agents.stuck_threshold_seconds,
        config.storage.read_connections,
    )
    .await?;

    let hub = LiveHub::new(config.live.queue_size);
    let (live_tx, live_rx) = mpsc::channel(config.live.handoff_capacity.max(1));
    let (alert_tx, alert_rx) = mpsc::channel(config.alerts.queue_capacity.max(1));

    let dispatcher = Dispatcher::new(
        hub.clone(),
        Duration::from_secs(config.alerts.webhook_timeout_seconds),
    )?;
    let evaluator = AlertEvaluator::new(store.clone(), dispatcher);
    let ingest = IngestPipeline::new(store.clone(), config.ingest.clone(), live_tx, alert_tx);

    let state = AppState::new(
        store.clone(),
        ingest,
        hub.clone(),
        config.live.clone(),
        config.ingest.max_body_bytes,
        config.server.cors_origins.clone(),
    );

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(BackgroundWorkers::new(
        hub.clone(),
        evaluator.clone(),
        live_rx,
        alert_rx,
    ))));
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(
        state,
        config.server.clone(),
    ))));

    BackgroundJobs {
        store,
        hub,
        evaluator,
        watchdog_interval_seconds: config.agents.watchdog_interval_seconds,
        alert_sweep_interval_seconds: config.alerts.sweep_interval_seconds,
        retention_days: config.storage.retention_days,
    }
    .register(&lifecycle)
    .await?;

    lifecycle.start().await?;

    terminal::print_success("hivewatch is running");
    terminal::print_status("Database", &db_path.display().to_string());
    terminal::print_link(
        "API",
        &format!("http://{}:{}", config.server.host, config.server.port),
    );
    terminal::print_link(
        "Live stream",
        &format!("ws://{}:{}/v1/stream", config.server.host, config.server.port),
    );
    terminal::print_info("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    lifecycle.shutdown().await?;
    terminal::print_goodbye();
    Ok(())
}
