//! Rule evaluation. Event-driven conditions run after each ingest hand-off;
//! time-driven ones run on the periodic sweep.

pub mod conditions;
pub mod dispatch;

pub use conditions::Trigger;
pub use dispatch::Dispatcher;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::core::model::{AlertFiring, AlertRule, Event};
use crate::core::store::EventStore;

/// Work handed from ingest to the evaluator.
#[derive(Debug, Clone)]
pub struct AlertWork {
    pub tenant_id: String,
    pub events: Vec<Event>,
}

#[derive(Clone)]
pub struct AlertEvaluator {
    store: EventStore,
    dispatcher: Arc<Dispatcher>,
}

impl AlertEvaluator {
    pub fn new(store: EventStore, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub async fn evaluate_ingest(&self, work: &AlertWork, now: DateTime<Utc>) -> Result<Vec<AlertFiring>> {
        let rules = self.store.list_rules(&work.tenant_id).await?;
        let mut fired = Vec::new();
        for rule in rules
            .iter()
            .filter(|r| r.enabled && !r.condition.is_time_driven())
        {
            match self.evaluate_rule(rule, Trigger::Ingest(&work.events), now).await {
                Ok(firings) => fired.extend(firings),
                Err(e) => error!("Evaluating rule {} failed: {}", rule.rule_id, e),
            }
        }
        Ok(fired)
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<AlertFiring>> {
        let rules = self.store.enabled_rules().await?;
        let mut fired = Vec::new();
        for rule in rules.iter().filter(|r| r.condition.is_time_driven()) {
            match self.evaluate_rule(rule, Trigger::Sweep, now).await {
                Ok(firings) => fired.extend(firings),
                Err(e) => error!("Sweeping rule {} failed: {}", rule.rule_id, e),
            }
        }
        Ok(fired)
    }

    async fn evaluate_rule(
        &self,
        rule: &AlertRule,
        trigger: Trigger<'_>,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlertFiring>> {
        let mut fired = Vec::new();
        for finding in conditions::check(&self.store, rule, trigger, now).await? {
            let Some(mut firing) = self
                .store
                .try_record_firing(rule, finding.snapshot, finding.environment.as_deref(), now)
                .await?
            else {
                debug!("Rule {} matched inside its cooldown", rule.rule_id);
                continue;
            };
            info!(
                "Alert '{}' ({}) fired for tenant {} in {}",
                rule.name,
                rule.condition.type_name(),
                rule.tenant_id,
                firing.environment.as_deref().unwrap_or("all environments")
            );

            let outcomes = self.dispatcher.dispatch(rule, &firing).await;
            for outcome in &outcomes {
                if let Err(e) = self.store.record_dispatch(&firing.firing_id, outcome).await {
                    error!(
                        "Recording {} outcome for firing {} failed: {}",
                        outcome.action, firing.firing_id, e
                    );
                }
            }
            if let Err(e) = self.store.mark_dispatched(&firing.firing_id).await {
                error!("Marking firing {} dispatched failed: {}", firing.firing_id, e);
            }
            firing.dispatched = true;
            firing.outcomes = outcomes;
            fired.push(firing);
        }
        Ok(fired)
    }
}

pub fn spawn_evaluator(evaluator: AlertEvaluator, mut rx: mpsc::Receiver<AlertWork>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(work) = rx.recv().await {
            if let Err(e) = evaluator.evaluate_ingest(&work, Utc::now()).await {
                error!("Alert evaluation for tenant {} failed: {}", work.tenant_id, e);
            }
        }
        info!("Alert evaluator stopped: ingest channel closed");
    })
}
