use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::LiveHub;
use crate::core::derive::agent_status;
use crate::core::model::{AgentProfile, AgentStatus};
use crate::core::store::EventStore;

/// One derived status reading for an agent.
#[derive(Debug, Clone)]
pub struct Observation {
    pub profile: AgentProfile,
    pub status: AgentStatus,
    /// Status derived from the profile before the update that produced this
    /// reading, when known.
    pub previous: Option<AgentStatus>,
    /// The agent's first events arrived in the batch behind this reading.
    pub newly_seen: bool,
    /// Every project the agent has reported events for.
    pub project_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub profile: AgentProfile,
    pub project_ids: Vec<String>,
    pub previous: Option<AgentStatus>,
    pub current: AgentStatus,
}

impl Transition {
    pub fn entered_stuck(&self) -> bool {
        self.current == AgentStatus::Stuck && self.previous != Some(AgentStatus::Stuck)
    }
}

/// Last observed status per `(tenant, agent, test partition)`. Each change
/// is reported exactly once, whichever path (ingest or watchdog) observes it
/// first.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: HashMap<(String, String, bool), AgentStatus>,
}

impl StatusTracker {
    pub fn observe(&mut self, obs: Observation) -> Option<Transition> {
        let key = (
            obs.profile.tenant_id.clone(),
            obs.profile.agent_id.clone(),
            obs.profile.is_test(),
        );
        let known = self.last.insert(key, obs.status).or(obs.previous);

        match known {
            Some(prev) if prev == obs.status => None,
            Some(prev) => Some(Transition {
                profile: obs.profile,
                project_ids: obs.project_ids,
                previous: Some(prev),
                current: obs.status,
            }),
            None if obs.newly_seen => Some(Transition {
                profile: obs.profile,
                project_ids: obs.project_ids,
                previous: None,
                current: obs.status,
            }),
            // First sighting from a sweep only seeds the tracker.
            None => None,
        }
    }
}

/// Projects linked to the agent. A lookup failure degrades to the last
/// project seen so a reading is never dropped.
pub async fn linked_projects(store: &EventStore, profile: &AgentProfile) -> Vec<String> {
    match store.agent_project_ids(&profile.tenant_id, &profile.agent_id).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!("Loading projects of agent {} failed: {}", profile.agent_id, e);
            profile.last_project_id.iter().cloned().collect()
        }
    }
}

/// Re-derives every agent's status so purely time-driven transitions
/// (silence turning into `stuck`) surface without new events.
pub async fn sweep_liveness(store: &EventStore, hub: &LiveHub, now: DateTime<Utc>) -> Result<usize> {
    let profiles = store.all_profiles().await?;
    let mut transitions = 0;
    for profile in profiles {
        let status = agent_status(&profile, now);
        let project_ids = linked_projects(store, &profile).await;
        let obs = Observation {
            profile,
            status,
            previous: None,
            newly_seen: false,
            project_ids,
        };
        if hub.observe(obs).await.is_some() {
            transitions += 1;
        }
    }
    debug!("Liveness sweep produced {} transitions", transitions);
    Ok(transitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::{TENANT, at, event, profile};
    use crate::core::live::{Channel, ServerMessage, SubscriptionFilter};
    use crate::core::model::EventType;
    use crate::core::store::test_event_store;

    fn obs(status: AgentStatus, previous: Option<AgentStatus>, newly_seen: bool) -> Observation {
        Observation {
            profile: profile("a1"),
            status,
            previous,
            newly_seen,
            project_ids: Vec::new(),
        }
    }

    #[test]
    fn sweep_seeding_is_silent() {
        let mut tracker = StatusTracker::default();
        assert!(tracker.observe(obs(AgentStatus::Idle, None, false)).is_none());
        let t = tracker.observe(obs(AgentStatus::Stuck, None, false)).unwrap();
        assert_eq!(t.previous, Some(AgentStatus::Idle));
    }

    #[test]
    fn each_change_is_reported_once() {
        let mut tracker = StatusTracker::default();
        tracker.observe(obs(AgentStatus::Idle, None, false));

        let t = tracker
            .observe(obs(AgentStatus::Processing, Some(AgentStatus::Idle), false))
            .unwrap();
        assert_eq!(t.previous, Some(AgentStatus::Idle));
        assert_eq!(t.current, AgentStatus::Processing);

        assert!(tracker.observe(obs(AgentStatus::Processing, None, false)).is_none());
    }

    #[test]
    fn tracker_memory_wins_over_profile_hint() {
        let mut tracker = StatusTracker::default();
        tracker.observe(obs(AgentStatus::Stuck, None, false));
        let t = tracker
            .observe(obs(AgentStatus::Processing, Some(AgentStatus::Idle), false))
            .unwrap();
        assert_eq!(t.previous, Some(AgentStatus::Stuck));
        assert!(!t.entered_stuck());
    }

    #[test]
    fn test_partition_is_tracked_apart_from_live() {
        let mut tracker = StatusTracker::default();
        tracker.observe(obs(AgentStatus::Processing, None, false));

        let mut test_reading = obs(AgentStatus::Error, None, false);
        test_reading.profile.environment = "test".to_string();
        assert!(tracker.observe(test_reading).is_none());

        assert!(tracker.observe(obs(AgentStatus::Processing, None, false)).is_none());
    }

    #[test]
    fn newly_seen_agents_announce_themselves() {
        let mut tracker = StatusTracker::default();
        let t = tracker.observe(obs(AgentStatus::Idle, None, true)).unwrap();
        assert_eq!(t.previous, None);
    }

    #[tokio::test]
    async fn silent_agent_goes_stuck_exactly_once() {
        let store = test_event_store();
        store
            .append(vec![event("a1", "hb", EventType::Heartbeat, 0)])
            .await
            .unwrap();

        let hub = LiveHub::new(16);
        let sub = hub.register(TENANT, None).await;
        hub.subscribe(sub.id, vec![Channel::Agents], SubscriptionFilter::default())
            .await;
        let _ = sub.queue.pop().await; // subscribed ack

        assert_eq!(sweep_liveness(&store, &hub, at(10)).await.unwrap(), 0);
        assert_eq!(sweep_liveness(&store, &hub, at(301)).await.unwrap(), 1);
        assert_eq!(sweep_liveness(&store, &hub, at(400)).await.unwrap(), 0);

        let mut stuck_notices = 0;
        let mut changes = 0;
        while !sub.queue.is_empty() {
            match sub.queue.pop().await {
                Some(ServerMessage::AgentStuck(_)) => stuck_notices += 1,
                Some(ServerMessage::StatusChanged(c)) => {
                    assert_eq!(c.new_status, AgentStatus::Stuck);
                    changes += 1;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!((changes, stuck_notices), (1, 1));
    }
}
