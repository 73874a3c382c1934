//! Write path: validate, store, then hand off to the broadcaster and the
//! alert evaluator without waiting on either.

pub mod validate;

pub use validate::{EventIssue, RejectCode, Stamp, WARNING_PAYLOAD_SHAPE, validate_event};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::core::alerts::AlertWork;
use crate::core::config::IngestConfig;
use crate::core::derive::status_change;
use crate::core::live::{LiveBatch, Observation, linked_projects};
use crate::core::model::{BatchEnvelope, TenantContext};
use crate::core::store::EventStore;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub envelope: Option<BatchEnvelope>,
    #[serde(default)]
    pub events: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct IngestReport {
    /// Valid events, including ones already stored earlier.
    pub accepted: usize,
    pub rejected: usize,
    pub warnings: usize,
    pub errors: Vec<EventIssue>,
    pub warning_details: Vec<EventIssue>,
}

/// Whole-batch failures. Per-event problems never surface here.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("batch has {size} events, the limit is {limit}")]
    BatchTooLarge { size: usize, limit: usize },
    #[error("batch contains no events")]
    EmptyBatch,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::InvalidEnvelope(_) => "invalid_envelope",
            IngestError::BatchTooLarge { .. } => "batch_too_large",
            IngestError::EmptyBatch => "empty_batch",
            IngestError::Store(_) => "internal",
        }
    }
}

#[derive(Clone)]
pub struct IngestPipeline {
    store: EventStore,
    limits: IngestConfig,
    live_tx: mpsc::Sender<LiveBatch>,
    alert_tx: mpsc::Sender<AlertWork>,
}

impl IngestPipeline {
    pub fn new(
        store: EventStore,
        limits: IngestConfig,
        live_tx: mpsc::Sender<LiveBatch>,
        alert_tx: mpsc::Sender<AlertWork>,
    ) -> Self {
        Self {
            store,
            limits,
            live_tx,
            alert_tx,
        }
    }

    pub async fn ingest(&self, ctx: &TenantContext, request: IngestRequest) -> Result<IngestReport, IngestError> {
        let envelope = request
            .envelope
            .ok_or_else(|| IngestError::InvalidEnvelope("envelope is required".to_string()))?;
        if envelope.agent_id.trim().is_empty() {
            return Err(IngestError::InvalidEnvelope("envelope.agent_id is required".to_string()));
        }
        let raw_events = request.events.unwrap_or_default();
        if raw_events.is_empty() {
            return Err(IngestError::EmptyBatch);
        }
        if raw_events.len() > self.limits.max_batch_events {
            return Err(IngestError::BatchTooLarge {
                size: raw_events.len(),
                limit: self.limits.max_batch_events,
            });
        }

        let environment = match ctx.forced_environment() {
            Some(forced) => forced.to_string(),
            None => envelope
                .environment
                .clone()
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| self.limits.default_environment.clone()),
        };
        let stamp = Stamp {
            tenant_id: ctx.tenant_id.clone(),
            agent_id: envelope.agent_id.clone(),
            environment,
            group: envelope.group.clone(),
            agent_meta: envelope.agent_meta(),
            received_at: Utc::now(),
        };

        let mut report = IngestReport::default();
        let mut valid = Vec::with_capacity(raw_events.len());
        for raw in raw_events {
            match validate_event(raw, &stamp, self.limits.max_payload_bytes) {
                Ok(v) => {
                    if let Some(w) = v.warning {
                        report.warning_details.push(w);
                    }
                    valid.push(v.event);
                }
                Err(issue) => report.errors.push(issue),
            }
        }
        report.accepted = valid.len();
        report.rejected = report.errors.len();
        report.warnings = report.warning_details.len();

        if valid.is_empty() {
            debug!("Batch from agent {} had no valid events", envelope.agent_id);
            return Ok(report);
        }

        let outcome = self.store.append(valid).await?;
        for project in &outcome.new_projects {
            info!("Registered project '{}' for tenant {} from ingest", project, ctx.tenant_id);
        }
        debug!(
            "Tenant {} stored {} events ({} duplicates, {} rejected)",
            ctx.tenant_id,
            outcome.inserted.len(),
            outcome.duplicates,
            report.rejected
        );

        if outcome.inserted.is_empty() {
            return Ok(report);
        }

        let now = Utc::now();
        let mut observations = Vec::with_capacity(outcome.profiles.len());
        for change in &outcome.profiles {
            let (previous, status) = status_change(change, now);
            observations.push(Observation {
                profile: change.after.clone(),
                status,
                previous,
                newly_seen: change.before.is_none(),
                project_ids: linked_projects(&self.store, &change.after).await,
            });
        }

        hand_off(
            &self.live_tx,
            LiveBatch {
                tenant_id: ctx.tenant_id.clone(),
                events: outcome.inserted.clone(),
                observations,
            },
            "broadcaster",
        );
        hand_off(
            &self.alert_tx,
            AlertWork {
                tenant_id: ctx.tenant_id.clone(),
                events: outcome.inserted,
            },
            "alert evaluator",
        );
        Ok(report)
    }
}

fn hand_off<T>(tx: &mpsc::Sender<T>, work: T, target: &str) {
    match tx.try_send(work) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("Dropping ingest hand-off: {} queue is full", target),
        Err(TrySendError::Closed(_)) => warn!("Dropping ingest hand-off: {} has stopped", target),
    }
}
