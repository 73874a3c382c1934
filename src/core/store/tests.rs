use chrono::Duration;
use serde_json::json;

use super::cursor::Cursor;
use super::*;
use crate::core::fixtures::{TENANT, at, event, task_event, with_payload};
use crate::core::model::{
    AgentMeta, AlertAction, AlertCondition, AlertRuleDraft, EventType, Severity,
};

#[tokio::test]
async fn reingesting_a_batch_is_a_no_op() {
    let store = test_event_store();
    let batch = vec![
        event("a1", "e1", EventType::AgentRegistered, 0),
        event("a1", "e2", EventType::Heartbeat, 10),
        task_event("a1", "t1", "e3", EventType::TaskStarted, 20),
    ];

    let first = store.append(batch.clone()).await.unwrap();
    assert_eq!(first.inserted.len(), 3);
    assert_eq!(first.duplicates, 0);
    let profile = store.get_profile(TENANT, "a1", None).await.unwrap().unwrap();

    let second = store.append(batch).await.unwrap();
    assert!(second.inserted.is_empty());
    assert_eq!(second.duplicates, 3);
    assert!(second.profiles.is_empty());

    let count = store
        .count_events(TENANT, &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(count, 3);
    assert_eq!(store.get_profile(TENANT, "a1", None).await.unwrap().unwrap(), profile);
}

#[tokio::test]
async fn concurrent_duplicates_store_exactly_once() {
    let store = test_event_store();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .append(vec![event("a1", "same", EventType::Heartbeat, 5)])
                .await
                .unwrap()
                .inserted
                .len()
        }));
    }
    let mut total = 0;
    for h in handles {
        total += h.await.unwrap();
    }
    assert_eq!(total, 1);
}

#[tokio::test]
async fn newest_timestamp_wins_regardless_of_arrival() {
    let store = test_event_store();
    store
        .append(vec![
            event("a1", "hb-late", EventType::Heartbeat, 100),
            task_event("a1", "t1", "start", EventType::TaskStarted, 200),
        ])
        .await
        .unwrap();
    store
        .append(vec![
            event("a1", "hb-early", EventType::Heartbeat, 50),
            task_event("a1", "t0", "old-fail", EventType::TaskFailed, 150),
        ])
        .await
        .unwrap();

    let p = store.get_profile(TENANT, "a1", None).await.unwrap().unwrap();
    assert_eq!(p.last_heartbeat_at, Some(at(100)));
    assert_eq!(p.last_event_type, Some(EventType::TaskStarted));
    assert_eq!(p.last_event_at, Some(at(200)));
    assert_eq!(p.last_task_id.as_deref(), Some("t1"));
    assert_eq!(p.first_seen_at, at(50));
    assert_eq!(p.last_seen_at, at(200));
}

#[tokio::test]
async fn heartbeats_and_custom_events_leave_last_event_alone() {
    let store = test_event_store();
    store
        .append(vec![task_event("a1", "t1", "e1", EventType::TaskStarted, 10)])
        .await
        .unwrap();
    store
        .append(vec![
            event("a1", "e2", EventType::Heartbeat, 20),
            event("a1", "e3", EventType::Custom, 30),
        ])
        .await
        .unwrap();

    let p = store.get_profile(TENANT, "a1", None).await.unwrap().unwrap();
    assert_eq!(p.last_event_type, Some(EventType::TaskStarted));
    assert_eq!(p.last_event_at, Some(at(10)));
    assert_eq!(p.last_heartbeat_at, Some(at(20)));
    assert_eq!(p.last_seen_at, at(30));
}

#[tokio::test]
async fn rebuilt_profile_matches_incremental_one() {
    let store = test_event_store();
    let mut registered = with_payload(
        event("a1", "reg", EventType::AgentRegistered, 0),
        "agent",
        json!({"stuck_threshold_seconds": 120}),
    );
    registered.agent_meta = Some(AgentMeta {
        agent_type: Some("triage".to_string()),
        framework: Some("langgraph".to_string()),
        ..Default::default()
    });
    registered.project_id = Some("billing".to_string());

    store
        .append(vec![registered, event("a1", "hb1", EventType::Heartbeat, 40)])
        .await
        .unwrap();
    store
        .append(vec![
            task_event("a1", "t1", "s1", EventType::TaskStarted, 30),
            event("a1", "c1", EventType::Custom, 90),
        ])
        .await
        .unwrap();
    store
        .append(vec![
            event("a1", "hb0", EventType::Heartbeat, 20),
            task_event("a1", "t1", "ap", EventType::ApprovalRequested, 60),
        ])
        .await
        .unwrap();

    let incremental = store.get_profile(TENANT, "a1", None).await.unwrap().unwrap();
    assert_eq!(incremental.stuck_threshold_seconds, 120);
    assert_eq!(incremental.agent_type.as_deref(), Some("triage"));
    assert_eq!(incremental.last_event_type, Some(EventType::ApprovalRequested));

    let rebuilt = store.rebuild_profile(TENANT, "a1").await.unwrap().unwrap();
    assert_eq!(rebuilt, incremental);
}

#[tokio::test]
async fn late_registration_does_not_roll_back_threshold() {
    let store = test_event_store();
    let newer = with_payload(
        event("a1", "reg2", EventType::AgentRegistered, 100),
        "agent",
        json!({"stuck_threshold_seconds": 60}),
    );
    let older = with_payload(
        event("a1", "reg1", EventType::AgentRegistered, 50),
        "agent",
        json!({"stuck_threshold_seconds": 600}),
    );
    store.append(vec![newer]).await.unwrap();
    store.append(vec![older]).await.unwrap();

    let profile = store.get_profile(TENANT, "a1", None).await.unwrap().unwrap();
    assert_eq!(profile.stuck_threshold_seconds, 60);
    let rebuilt = store.rebuild_profile(TENANT, "a1").await.unwrap().unwrap();
    assert_eq!(rebuilt.stuck_threshold_seconds, 60);
}

#[tokio::test]
async fn test_traffic_keeps_its_own_profile() {
    let store = test_event_store();
    store
        .append(vec![event("a1", "hb", EventType::Heartbeat, 0)])
        .await
        .unwrap();
    let live = store
        .get_profile(TENANT, "a1", Some("production"))
        .await
        .unwrap()
        .unwrap();

    let mut failed = task_event("a1", "ci-1", "ci-fail", EventType::TaskFailed, 10);
    failed.environment = "test".to_string();
    let outcome = store.append(vec![failed]).await.unwrap();
    assert_eq!(outcome.profiles.len(), 1);
    assert!(outcome.profiles[0].before.is_none());

    let after = store
        .get_profile(TENANT, "a1", Some("production"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after, live);
    assert_eq!(store.get_profile(TENANT, "a1", None).await.unwrap().unwrap(), live);

    let test = store
        .get_profile(TENANT, "a1", Some("test"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(test.last_event_type, Some(EventType::TaskFailed));
    assert_eq!(test.environment, "test");

    let production = store
        .list_profiles(TENANT, Some("production"), None)
        .await
        .unwrap();
    assert_eq!(production.len(), 1);
    assert_eq!(store.list_profiles(TENANT, None, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn file_store_reads_while_the_writer_is_held() {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(dir.path().join("hivewatch.db"), 300, 2)
        .await
        .unwrap();
    store
        .append(vec![event("a1", "hb", EventType::Heartbeat, 0)])
        .await
        .unwrap();

    let _writer = store.db.lock().await;
    let count = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        store.count_events(TENANT, &EventFilter::default()),
    )
    .await
    .expect("reads must not wait on the writer")
    .unwrap();
    assert_eq!(count, 1);
    let profile = store.get_profile(TENANT, "a1", None).await.unwrap();
    assert!(profile.is_some());
}

#[tokio::test]
async fn unknown_projects_are_registered_on_ingest() {
    let store = test_event_store();
    let mut e = event("a1", "e1", EventType::AgentRegistered, 0);
    e.project_id = Some("support".to_string());
    let outcome = store.append(vec![e]).await.unwrap();
    assert_eq!(outcome.new_projects, vec!["support".to_string()]);

    let project = store.get_project(TENANT, "support").await.unwrap().unwrap();
    assert_eq!(project.slug, "support");
    assert!(!project.is_default);
    assert_eq!(
        store.agent_project_ids(TENANT, "a1").await.unwrap(),
        vec!["support".to_string()]
    );
    let scoped = store
        .list_profiles(TENANT, None, Some("support"))
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);
    assert!(
        store
            .list_profiles(TENANT, None, Some("other"))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn query_pages_newest_first_without_overlap() {
    let store = test_event_store();
    let batch = vec![
        event("a1", "e1", EventType::Heartbeat, 1),
        event("a1", "e2", EventType::Heartbeat, 2),
        event("a1", "e3", EventType::Heartbeat, 2),
        event("a1", "e4", EventType::Heartbeat, 3),
        event("a1", "e5", EventType::Heartbeat, 4),
    ];
    store.append(batch).await.unwrap();

    let filter = EventFilter::default();
    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = store
            .query_events(TENANT, &filter, cursor, 2)
            .await
            .unwrap();
        seen.extend(page.events.iter().map(|e| e.event_id.clone()));
        match page.next_cursor {
            Some(next) => cursor = Cursor::decode(&next),
            None => break,
        }
    }
    assert_eq!(seen, vec!["e5", "e4", "e3", "e2", "e1"]);
}

#[tokio::test]
async fn query_filters_by_type_and_severity() {
    let store = test_event_store();
    store
        .append(vec![
            event("a1", "e1", EventType::Heartbeat, 1),
            task_event("a1", "t1", "e2", EventType::TaskStarted, 2),
            task_event("a1", "t1", "e3", EventType::TaskFailed, 3),
            event("a2", "e4", EventType::Escalated, 4),
        ])
        .await
        .unwrap();

    let filter = EventFilter {
        min_severity: Some(Severity::Warn),
        ..Default::default()
    };
    let page = store.query_events(TENANT, &filter, None, 50).await.unwrap();
    let ids: Vec<_> = page.events.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids, vec!["e4", "e3"]);

    let filter = EventFilter {
        event_types: vec![EventType::TaskStarted, EventType::Heartbeat],
        agent_id: Some("a1".to_string()),
        ..Default::default()
    };
    let page = store.query_events(TENANT, &filter, None, 50).await.unwrap();
    assert_eq!(page.events.len(), 2);
    assert!(page.next_cursor.is_none());
}

#[tokio::test]
async fn tenants_never_see_each_other() {
    let store = test_event_store();
    let mine = event("a1", "shared-id", EventType::Heartbeat, 1);
    let mut theirs = event("a1", "shared-id", EventType::Heartbeat, 1);
    theirs.tenant_id = "tenant-b".to_string();

    let outcome = store.append(vec![mine, theirs]).await.unwrap();
    assert_eq!(outcome.inserted.len(), 2);

    let page = store
        .query_events("tenant-b", &EventFilter::default(), None, 50)
        .await
        .unwrap();
    assert_eq!(page.events.len(), 1);
    assert_eq!(page.events[0].tenant_id, "tenant-b");
    assert!(store.get_profile("tenant-c", "a1", None).await.unwrap().is_none());
}

#[tokio::test]
async fn firing_respects_cooldown() {
    let store = test_event_store();
    let rule = store
        .create_rule(
            TENANT,
            AlertRuleDraft {
                name: "failures".to_string(),
                condition: AlertCondition::TaskFailureCount {
                    count: 3,
                    window_seconds: 600,
                },
                project_id: None,
                actions: vec![AlertAction::Log],
                cooldown_seconds: Some(300),
                enabled: None,
            },
        )
        .await
        .unwrap();
    assert!(rule.enabled);

    let t = at(0);
    assert!(
        store
            .try_record_firing(&rule, json!({}), Some("production"), t)
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        store
            .try_record_firing(&rule, json!({}), Some("production"), t + Duration::seconds(100))
            .await
            .unwrap()
            .is_none()
    );
    let later = store
        .try_record_firing(&rule, json!({}), Some("production"), t + Duration::seconds(301))
        .await
        .unwrap();
    assert!(later.is_some());

    let history = store.list_firings(TENANT, None, None, None, 10).await.unwrap();
    assert_eq!(history.firings.len(), 2);
    assert!(history.firings[0].fired_at > history.firings[1].fired_at);
}

#[tokio::test]
async fn dispatch_outcomes_attach_to_history() {
    let store = test_event_store();
    let rule = store
        .create_rule(
            TENANT,
            AlertRuleDraft {
                name: "slow".to_string(),
                condition: AlertCondition::DurationExceeded { threshold_ms: 1000 },
                project_id: None,
                actions: vec![AlertAction::Log],
                cooldown_seconds: None,
                enabled: None,
            },
        )
        .await
        .unwrap();
    let firing = store
        .try_record_firing(&rule, json!({"duration_ms": 5000}), Some("production"), at(0))
        .await
        .unwrap()
        .unwrap();
    store
        .record_dispatch(
            &firing.firing_id,
            &crate::core::model::DispatchOutcome {
                action: "webhook".to_string(),
                ok: false,
                detail: Some("connection refused".to_string()),
                recorded_at: at(1),
            },
        )
        .await
        .unwrap();

    let page = store
        .list_firings(TENANT, Some(&rule.rule_id), None, None, 10)
        .await
        .unwrap();
    assert_eq!(page.firings.len(), 1);
    assert_eq!(page.firings[0].outcomes.len(), 1);
    assert!(!page.firings[0].outcomes[0].ok);
    assert_eq!(page.firings[0].condition_snapshot, json!({"duration_ms": 5000}));
}

#[tokio::test]
async fn corrupt_rule_actions_surface_as_errors() {
    let store = test_event_store();
    let rule = store
        .create_rule(
            TENANT,
            AlertRuleDraft {
                name: "slow".to_string(),
                condition: AlertCondition::DurationExceeded { threshold_ms: 1000 },
                project_id: None,
                actions: vec![AlertAction::Log],
                cooldown_seconds: None,
                enabled: None,
            },
        )
        .await
        .unwrap();
    store
        .db
        .lock()
        .await
        .execute(
            "UPDATE alert_rules SET actions_json = '[{\"type\": \"pager\"}]' WHERE rule_id = ?1",
            [&rule.rule_id],
        )
        .unwrap();

    assert!(store.list_rules(TENANT).await.is_err());
    assert!(store.get_rule(TENANT, &rule.rule_id).await.is_err());
}

#[tokio::test]
async fn firing_cooldown_is_kept_per_environment() {
    let store = test_event_store();
    let rule = store
        .create_rule(
            TENANT,
            AlertRuleDraft {
                name: "slow".to_string(),
                condition: AlertCondition::DurationExceeded { threshold_ms: 1000 },
                project_id: None,
                actions: vec![AlertAction::Log],
                cooldown_seconds: Some(300),
                enabled: None,
            },
        )
        .await
        .unwrap();
    let fired = |env: &'static str, secs: i64| {
        let store = store.clone();
        let rule = rule.clone();
        async move {
            store
                .try_record_firing(&rule, json!({}), Some(env), at(secs))
                .await
                .unwrap()
                .is_some()
        }
    };
    assert!(fired("test", 0).await);
    assert!(fired("production", 10).await);
    assert!(!fired("test", 20).await);

    let test_only = store
        .list_firings(TENANT, None, Some("test"), None, 10)
        .await
        .unwrap();
    assert_eq!(test_only.firings.len(), 1);
    assert_eq!(test_only.firings[0].environment.as_deref(), Some("test"));
}

#[tokio::test]
async fn keys_resolve_until_revoked() {
    let store = test_event_store();
    let (tenant, raw, record) = store.create_tenant("Acme").await.unwrap();
    assert!(raw.starts_with("hw_live_"));

    let ctx = store.resolve_api_key(&raw).await.unwrap().unwrap();
    assert_eq!(ctx.tenant_id, tenant.tenant_id);
    assert!(store.resolve_api_key("hw_live_nope").await.unwrap().is_none());

    assert!(store.revoke_api_key(&record.key_id).await.unwrap());
    assert!(store.resolve_api_key(&raw).await.unwrap().is_none());
    assert!(
        store
            .create_api_key("missing-tenant", "x", crate::core::model::AccessLevel::Read)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn default_project_cannot_be_deleted() {
    let store = test_event_store();
    let (tenant, _, _) = store.create_tenant("Acme").await.unwrap();
    let projects = store.list_projects(&tenant.tenant_id).await.unwrap();
    assert_eq!(projects.len(), 1);
    assert!(projects[0].is_default);

    assert!(!store.delete_project(&tenant.tenant_id, "default").await.unwrap());

    let created = store
        .create_project(&tenant.tenant_id, "Billing Bots")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(created.project_id, "billing-bots");
    assert!(
        store
            .create_project(&tenant.tenant_id, "billing bots")
            .await
            .unwrap()
            .is_none()
    );
    assert!(store.delete_project(&tenant.tenant_id, "billing-bots").await.unwrap());
}

#[tokio::test]
async fn retention_purges_old_rows() {
    let store = test_event_store();
    store
        .append(vec![
            event("a1", "old", EventType::Heartbeat, 0),
            event("a1", "new", EventType::Heartbeat, 1000),
        ])
        .await
        .unwrap();
    let (events, _) = store
        .purge_before(at(500).timestamp_millis())
        .await
        .unwrap();
    assert_eq!(events, 1);
    let remaining = store
        .count_events(TENANT, &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(remaining, 1);
}
