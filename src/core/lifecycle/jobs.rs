//! Periodic and long-running background work: the liveness watchdog, the
//! time-driven alert sweep, retention, and the ingest consumers.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::Job;
use tracing::{error, info};

use super::{LifecycleComponent, LifecycleManager};
use crate::core::alerts::{AlertEvaluator, AlertWork, spawn_evaluator};
use crate::core::live::{LiveBatch, LiveHub, spawn_broadcaster, tracker::sweep_liveness};
use crate::core::store::EventStore;

/// Daily at 03:15 UTC.
const RETENTION_CRON: &str = "0 15 3 * * *";

/// Oldest timestamp to keep, or `None` when retention is disabled.
pub fn retention_cutoff(now: DateTime<Utc>, retention_days: u32) -> Option<i64> {
    if retention_days == 0 {
        return None;
    }
    Some((now - ChronoDuration::days(i64::from(retention_days))).timestamp_millis())
}

pub struct BackgroundJobs {
    pub store: EventStore,
    pub hub: LiveHub,
    pub evaluator: AlertEvaluator,
    pub watchdog_interval_seconds: u64,
    pub alert_sweep_interval_seconds: u64,
    pub retention_days: u32,
}

impl BackgroundJobs {
    pub async fn register(self, lifecycle: &LifecycleManager) -> Result<()> {
        let store = self.store.clone();
        let hub = self.hub.clone();
        let watchdog = Job::new_repeated_async(
            Duration::from_secs(self.watchdog_interval_seconds.max(1)),
            move |_uuid, mut _l| {
                let store = store.clone();
                let hub = hub.clone();
                Box::pin(async move {
                    if let Err(e) = sweep_liveness(&store, &hub, Utc::now()).await {
                        error!("Liveness watchdog failed: {}", e);
                    }
                })
            },
        )?;
        lifecycle.scheduler.add(watchdog).await?;

        let evaluator = self.evaluator.clone();
        let sweep = Job::new_repeated_async(
            Duration::from_secs(self.alert_sweep_interval_seconds.max(1)),
            move |_uuid, mut _l| {
                let evaluator = evaluator.clone();
                Box::pin(async move {
                    if let Err(e) = evaluator.sweep(Utc::now()).await {
                        error!("Alert sweep failed: {}", e);
                    }
                })
            },
        )?;
        lifecycle.scheduler.add(sweep).await?;

        if self.retention_days > 0 {
            let store = self.store.clone();
            let days = self.retention_days;
            let retention = Job::new_async(RETENTION_CRON, move |_uuid, mut _l| {
                let store = store.clone();
                Box::pin(async move {
                    let Some(cutoff) = retention_cutoff(Utc::now(), days) else {
                        return;
                    };
                    match store.purge_before(cutoff).await {
                        Ok((events, firings)) => info!(
                            "Retention removed {} events and {} firings older than {} days",
                            events, firings, days
                        ),
                        Err(e) => error!("Retention sweep failed: {}", e),
                    }
                })
            })?;
            lifecycle.scheduler.add(retention).await?;
        } else {
            info!("Retention disabled, events are kept forever");
        }

        info!(
            "Background jobs registered (watchdog every {}s, alert sweep every {}s)",
            self.watchdog_interval_seconds, self.alert_sweep_interval_seconds
        );
        Ok(())
    }
}

/// Consumers of the ingest hand-off channels. They run for the life of the
/// process and are aborted on shutdown.
pub struct BackgroundWorkers {
    hub: LiveHub,
    evaluator: AlertEvaluator,
    live_rx: Option<mpsc::Receiver<LiveBatch>>,
    alert_rx: Option<mpsc::Receiver<AlertWork>>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundWorkers {
    pub fn new(
        hub: LiveHub,
        evaluator: AlertEvaluator,
        live_rx: mpsc::Receiver<LiveBatch>,
        alert_rx: mpsc::Receiver<AlertWork>,
    ) -> Self {
        Self {
            hub,
            evaluator,
            live_rx: Some(live_rx),
            alert_rx: Some(alert_rx),
            handles: Vec::new(),
        }
    }
}

#[async_trait]
impl LifecycleComponent for BackgroundWorkers {
    async fn on_start(&mut self) -> Result<()> {
        if let Some(rx) = self.live_rx.take() {
            self.handles.push(spawn_broadcaster(self.hub.clone(), rx));
        }
        if let Some(rx) = self.alert_rx.take() {
            self.handles.push(spawn_evaluator(self.evaluator.clone(), rx));
        }
        info!("Broadcaster and alert evaluator running");
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn zero_days_disables_retention() {
        assert_eq!(retention_cutoff(Utc::now(), 0), None);
    }

    #[test]
    fn cutoff_is_whole_days_back() {
        let now = Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap();
        let cutoff = retention_cutoff(now, 30).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(cutoff, expected.timestamp_millis());
    }
}
