//! Real-time fan-out of stored events, agent status transitions and alert
//! notifications to WebSocket subscribers.

mod filter;
mod queue;
pub mod tracker;

pub use filter::{Channel, Subscription, SubscriptionFilter};
pub use queue::OutboundQueue;
pub use tracker::{Observation, StatusTracker, Transition, linked_projects};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core::model::{AgentStatus, AlertFiring, Event};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusChange {
    pub agent_id: String,
    pub environment: String,
    pub project_id: Option<String>,
    pub previous_status: Option<AgentStatus>,
    pub new_status: AgentStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StuckNotice {
    pub agent_id: String,
    pub environment: String,
    pub project_id: Option<String>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub threshold_seconds: i64,
    pub at: DateTime<Utc>,
}

/// Wire shape: `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "subscribed")]
    Subscribed {
        channels: Vec<Channel>,
        filters: SubscriptionFilter,
    },
    #[serde(rename = "event.new")]
    EventNew(Box<Event>),
    #[serde(rename = "agent.status_changed")]
    StatusChanged(StatusChange),
    #[serde(rename = "agent.stuck")]
    AgentStuck(StuckNotice),
    #[serde(rename = "alert.fired")]
    AlertFired(Box<AlertFiring>),
    #[serde(rename = "ping")]
    Ping { ts: i64 },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerMessage {
    /// Raw event traffic is the first thing shed under backpressure.
    pub fn is_low_priority(&self) -> bool {
        matches!(self, ServerMessage::EventNew(_))
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default)]
        channels: Vec<Channel>,
        #[serde(default)]
        filters: SubscriptionFilter,
    },
    Unsubscribe,
    Pong,
}

/// Work handed from ingest to the broadcaster.
#[derive(Debug, Clone)]
pub struct LiveBatch {
    pub tenant_id: String,
    pub events: Vec<Event>,
    pub observations: Vec<Observation>,
}

struct Subscriber {
    tenant_id: String,
    forced_environment: Option<String>,
    subscription: Option<Subscription>,
    queue: Arc<OutboundQueue>,
}

pub struct SubscriberHandle {
    pub id: u64,
    pub queue: Arc<OutboundQueue>,
}

#[derive(Clone)]
pub struct LiveHub {
    subscribers: Arc<RwLock<HashMap<u64, Subscriber>>>,
    tracker: Arc<Mutex<StatusTracker>>,
    next_id: Arc<AtomicU64>,
    queue_size: usize,
}

impl LiveHub {
    pub fn new(queue_size: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            tracker: Arc::new(Mutex::new(StatusTracker::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            queue_size,
        }
    }

    /// Adds a connection. It receives nothing until it subscribes.
    pub async fn register(&self, tenant_id: &str, forced_environment: Option<&str>) -> SubscriberHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(OutboundQueue::new(self.queue_size));
        self.subscribers.write().await.insert(
            id,
            Subscriber {
                tenant_id: tenant_id.to_string(),
                forced_environment: forced_environment.map(str::to_string),
                subscription: None,
                queue: queue.clone(),
            },
        );
        debug!("Live subscriber {} registered for tenant {}", id, tenant_id);
        SubscriberHandle { id, queue }
    }

    /// Replaces the subscriber's channels and filter wholesale and acks.
    /// An empty channel list means every channel.
    pub async fn subscribe(
        &self,
        id: u64,
        channels: Vec<Channel>,
        mut filter: SubscriptionFilter,
    ) -> Option<Subscription> {
        let mut subscribers = self.subscribers.write().await;
        let sub = subscribers.get_mut(&id)?;
        if let Some(env) = &sub.forced_environment {
            filter.environment = Some(env.clone());
        }
        let channels: HashSet<Channel> = if channels.is_empty() {
            Channel::ALL.into_iter().collect()
        } else {
            channels.into_iter().collect()
        };
        let subscription = Subscription { channels, filter };
        sub.subscription = Some(subscription.clone());

        let mut acked: Vec<Channel> = subscription.channels.iter().copied().collect();
        acked.sort_by_key(|c| Channel::ALL.iter().position(|x| x == c));
        sub.queue.push(ServerMessage::Subscribed {
            channels: acked,
            filters: subscription.filter.clone(),
        });
        Some(subscription)
    }

    pub async fn unsubscribe(&self, id: u64) {
        if let Some(sub) = self.subscribers.write().await.get_mut(&id) {
            sub.subscription = None;
        }
    }

    pub async fn remove(&self, id: u64) {
        if let Some(sub) = self.subscribers.write().await.remove(&id) {
            sub.queue.close();
            debug!("Live subscriber {} removed", id);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    async fn fan_out<F>(&self, tenant_id: &str, channel: Channel, mut build: F)
    where
        F: FnMut(&SubscriptionFilter) -> Option<ServerMessage>,
    {
        let subscribers = self.subscribers.read().await;
        for sub in subscribers.values() {
            if sub.tenant_id != tenant_id {
                continue;
            }
            let Some(subscription) = &sub.subscription else {
                continue;
            };
            if !subscription.channels.contains(&channel) {
                continue;
            }
            if let Some(message) = build(&subscription.filter) {
                sub.queue.push(message);
            }
        }
    }

    pub async fn publish_events(&self, tenant_id: &str, events: &[Event]) {
        for event in events {
            self.fan_out(tenant_id, Channel::Events, |filter| {
                filter
                    .matches_event(event)
                    .then(|| ServerMessage::EventNew(Box::new(event.clone())))
            })
            .await;
        }
    }

    /// Feeds a status reading through the tracker and publishes the
    /// resulting transition, if any.
    pub async fn observe(&self, obs: Observation) -> Option<Transition> {
        let transition = self.tracker.lock().await.observe(obs)?;
        let now = Utc::now();
        let profile = &transition.profile;
        let projects = &transition.project_ids;

        let change = StatusChange {
            agent_id: profile.agent_id.clone(),
            environment: profile.environment.clone(),
            project_id: profile.last_project_id.clone(),
            previous_status: transition.previous,
            new_status: transition.current,
            at: now,
        };
        self.fan_out(&profile.tenant_id, Channel::Agents, |filter| {
            filter
                .matches_agent(profile, projects)
                .then(|| ServerMessage::StatusChanged(change.clone()))
        })
        .await;

        if transition.entered_stuck() {
            info!(
                "Agent {} of tenant {} is stuck (threshold {}s)",
                profile.agent_id, profile.tenant_id, profile.stuck_threshold_seconds
            );
            let notice = StuckNotice {
                agent_id: profile.agent_id.clone(),
                environment: profile.environment.clone(),
                project_id: profile.last_project_id.clone(),
                last_heartbeat_at: profile.liveness_at(),
                threshold_seconds: profile.stuck_threshold_seconds,
                at: now,
            };
            self.fan_out(&profile.tenant_id, Channel::Agents, |filter| {
                filter
                    .matches_agent(profile, projects)
                    .then(|| ServerMessage::AgentStuck(notice.clone()))
            })
            .await;
        }
        Some(transition)
    }

    pub async fn notify_alert(&self, firing: &AlertFiring) {
        self.fan_out(&firing.tenant_id, Channel::Alerts, |filter| {
            filter
                .matches_alert(firing)
                .then(|| ServerMessage::AlertFired(Box::new(firing.clone())))
        })
        .await;
    }
}

/// Drains ingest hand-offs into the hub until the sender side closes.
pub fn spawn_broadcaster(hub: LiveHub, mut rx: mpsc::Receiver<LiveBatch>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            hub.publish_events(&batch.tenant_id, &batch.events).await;
            for obs in batch.observations {
                hub.observe(obs).await;
            }
        }
        info!("Broadcaster stopped: ingest channel closed");
    })
}
