use axum::{
    Router,
    body::Body,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::get,
};
use tower_http::cors::{Any, CorsLayer};

use super::AppState;
use super::auth;
use super::handlers::{agents, alerts, events, ingest, metrics, projects, stream, tasks};

fn build_cors(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    layer.allow_origin(origins)
}

pub fn build_api_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .layer(middleware::from_fn(security_headers));

    let authed_routes = Router::new()
        .route("/v1/ingest", axum::routing::post(ingest::ingest_batch))
        .route("/v1/agents", get(agents::list_agents))
        .route("/v1/agents/{agent_id}", get(agents::get_agent))
        .route("/v1/agents/{agent_id}/pipeline", get(agents::get_pipeline))
        .route("/v1/tasks", get(tasks::list_tasks))
        .route("/v1/tasks/{task_id}", get(tasks::get_task))
        .route("/v1/tasks/{task_id}/timeline", get(tasks::get_timeline))
        .route("/v1/events", get(events::list_events))
        .route("/v1/metrics", get(metrics::get_metrics))
        .route("/v1/cost", get(metrics::get_cost))
        .route("/v1/cost/timeseries", get(metrics::get_cost_timeseries))
        .route(
            "/v1/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route(
            "/v1/projects/{project_id}",
            axum::routing::patch(projects::rename_project).delete(projects::delete_project),
        )
        .route(
            "/v1/projects/{project_id}/agents",
            get(projects::list_project_agents),
        )
        .route(
            "/v1/alerts/rules",
            get(alerts::list_rules).post(alerts::create_rule),
        )
        .route(
            "/v1/alerts/rules/{rule_id}",
            get(alerts::get_rule)
                .put(alerts::replace_rule)
                .delete(alerts::delete_rule),
        )
        .route("/v1/alerts/history", get(alerts::list_history))
        .route("/v1/stream", get(stream::stream_endpoint))
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(build_cors(&state.cors_origins))
        .with_state(state);

    public_routes.merge(authed_routes)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{IngestConfig, LiveConfig};
    use crate::core::ingest::IngestPipeline;
    use crate::core::live::LiveHub;
    use crate::core::model::AccessLevel;
    use crate::core::store::test_event_store;
    use axum::http::StatusCode;
    use chrono::Utc;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;
    use tower::util::ServiceExt;

    struct Harness {
        app: Router,
        state: AppState,
        key: String,
        tenant_id: String,
    }

    async fn harness() -> Harness {
        let store = test_event_store();
        let (live_tx, _live_rx) = mpsc::channel(64);
        let (alert_tx, _alert_rx) = mpsc::channel(64);
        let ingest = IngestPipeline::new(store.clone(), IngestConfig::default(), live_tx, alert_tx);
        let state = AppState::new(
            store.clone(),
            ingest,
            LiveHub::new(16),
            LiveConfig::default(),
            1024 * 1024,
            vec![],
        );
        let (tenant, key, _) = store.create_tenant("acme").await.unwrap();
        Harness {
            app: build_api_router(state.clone()),
            state,
            key,
            tenant_id: tenant.tenant_id,
        }
    }

    async fn call(
        app: &Router,
        method: Method,
        path: &str,
        body: Option<Value>,
        key: Option<&str>,
    ) -> (StatusCode, Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };
        let mut req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(key) = key {
            req = req.header("authorization", format!("Bearer {}", key));
        }
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap_or(json!({}));
        (status, json)
    }

    fn batch(agent_id: &str) -> Value {
        let now = Utc::now().timestamp_millis();
        json!({
            "envelope": {"agent_id": agent_id, "agent_type": "support", "environment": "production"},
            "events": [
                {"event_id": format!("{}-reg", agent_id), "event_type": "agent_registered",
                 "timestamp": now - 1000},
                {"event_id": format!("{}-t1", agent_id), "event_type": "task_started",
                 "task_id": "ticket-1", "timestamp": now},
            ]
        })
    }

    #[tokio::test]
    async fn health_is_public_and_hardened() {
        let h = harness().await;
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = h.app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn missing_or_unknown_key_is_unauthorized() {
        let h = harness().await;
        let (status, json) = call(&h.app, Method::GET, "/v1/agents", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["code"], "unauthorized");

        let (status, _) = call(&h.app, Method::GET, "/v1/agents", None, Some("hw_live_nope")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ingested_agents_are_listed() {
        let h = harness().await;
        let (status, report) =
            call(&h.app, Method::POST, "/v1/ingest", Some(batch("a1")), Some(&h.key)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["accepted"], 2);
        assert_eq!(report["rejected"], 0);

        let (status, json) = call(&h.app, Method::GET, "/v1/agents", None, Some(&h.key)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 1);
        assert_eq!(json["agents"][0]["agent_id"], "a1");
        assert_eq!(json["agents"][0]["status"], "processing");

        let (status, json) =
            call(&h.app, Method::GET, "/v1/tasks/ticket-1", None, Some(&h.key)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["task"]["status"], "processing");
    }

    #[tokio::test]
    async fn read_keys_cannot_ingest() {
        let h = harness().await;
        let (read_key, _) = h
            .state
            .store
            .create_api_key(&h.tenant_id, "dashboard", AccessLevel::Read)
            .await
            .unwrap()
            .unwrap();
        let (status, json) =
            call(&h.app, Method::POST, "/v1/ingest", Some(batch("a1")), Some(&read_key)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["code"], "forbidden");

        let (status, _) = call(&h.app, Method::GET, "/v1/agents", None, Some(&read_key)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn tenants_never_see_each_other() {
        let h = harness().await;
        call(&h.app, Method::POST, "/v1/ingest", Some(batch("a1")), Some(&h.key)).await;

        let (_, other_key, _) = h.state.store.create_tenant("globex").await.unwrap();
        let (_, json) = call(&h.app, Method::GET, "/v1/agents", None, Some(&other_key)).await;
        assert_eq!(json["count"], 0);

        let (status, _) = call(&h.app, Method::GET, "/v1/agents/a1", None, Some(&other_key)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, json) = call(&h.app, Method::GET, "/v1/events", None, Some(&other_key)).await;
        assert_eq!(json["events"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_keys_only_see_test_environment() {
        let h = harness().await;
        call(&h.app, Method::POST, "/v1/ingest", Some(batch("prod-agent")), Some(&h.key)).await;
        let (test_key, _) = h
            .state
            .store
            .create_api_key(&h.tenant_id, "ci", AccessLevel::Test)
            .await
            .unwrap()
            .unwrap();
        call(&h.app, Method::POST, "/v1/ingest", Some(batch("ci-agent")), Some(&test_key)).await;

        let (_, json) = call(
            &h.app,
            Method::GET,
            "/v1/agents?environment=production",
            None,
            Some(&test_key),
        )
        .await;
        assert_eq!(json["count"], 1);
        assert_eq!(json["agents"][0]["agent_id"], "ci-agent");
        assert_eq!(json["agents"][0]["environment"], "test");

        let (status, _) =
            call(&h.app, Method::GET, "/v1/agents/prod-agent", None, Some(&test_key)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_requests_get_error_codes() {
        let h = harness().await;
        let (status, json) = call(
            &h.app,
            Method::GET,
            "/v1/events?cursor=not-a-cursor",
            None,
            Some(&h.key),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "invalid_cursor");

        let (status, json) =
            call(&h.app, Method::GET, "/v1/metrics?range=2y", None, Some(&h.key)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "invalid_parameter");

        let (status, json) = call(
            &h.app,
            Method::POST,
            "/v1/ingest",
            Some(json!({"events": []})),
            Some(&h.key),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "invalid_envelope");

        let (status, json) =
            call(&h.app, Method::GET, "/v1/tasks/nope", None, Some(&h.key)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn project_lifecycle() {
        let h = harness().await;
        let (status, json) = call(
            &h.app,
            Method::POST,
            "/v1/projects",
            Some(json!({"name": "Billing Bots"})),
            Some(&h.key),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["project"]["project_id"], "billing-bots");

        let (status, json) = call(
            &h.app,
            Method::POST,
            "/v1/projects",
            Some(json!({"name": "billing bots"})),
            Some(&h.key),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"]["code"], "conflict");

        let (status, _) =
            call(&h.app, Method::DELETE, "/v1/projects/default", None, Some(&h.key)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) =
            call(&h.app, Method::DELETE, "/v1/projects/billing-bots", None, Some(&h.key)).await;
        assert_eq!(status, StatusCode::OK);
        let (_, json) = call(&h.app, Method::GET, "/v1/projects", None, Some(&h.key)).await;
        assert_eq!(json["projects"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn alert_rules_round_trip_through_api() {
        let h = harness().await;
        let (status, json) = call(
            &h.app,
            Method::POST,
            "/v1/alerts/rules",
            Some(json!({
                "name": "too many failures",
                "condition": {"type": "task_failure_count", "count": 3, "window_seconds": 600},
                "actions": [{"type": "notify"}]
            })),
            Some(&h.key),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let rule_id = json["rule"]["rule_id"].as_str().unwrap().to_string();
        assert_eq!(json["rule"]["cooldown_seconds"], 300);

        let path = format!("/v1/alerts/rules/{}", rule_id);
        let (status, _) = call(&h.app, Method::GET, &path, None, Some(&h.key)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&h.app, Method::DELETE, &path, None, Some(&h.key)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&h.app, Method::GET, &path, None, Some(&h.key)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) =
            call(&h.app, Method::GET, "/v1/alerts/history", None, Some(&h.key)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["firings"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_traffic_leaves_the_production_profile_alone() {
        let h = harness().await;
        call(&h.app, Method::POST, "/v1/ingest", Some(batch("a1")), Some(&h.key)).await;
        let (test_key, _) = h
            .state
            .store
            .create_api_key(&h.tenant_id, "ci", AccessLevel::Test)
            .await
            .unwrap()
            .unwrap();
        let failed = json!({
            "envelope": {"agent_id": "a1", "environment": "test"},
            "events": [{"event_id": "a1-ci-fail", "event_type": "task_failed",
                        "task_id": "ci-1", "timestamp": Utc::now().timestamp_millis()}]
        });
        call(&h.app, Method::POST, "/v1/ingest", Some(failed), Some(&test_key)).await;

        let (_, json) = call(
            &h.app,
            Method::GET,
            "/v1/agents?environment=production",
            None,
            Some(&h.key),
        )
        .await;
        assert_eq!(json["count"], 1);
        assert_eq!(json["agents"][0]["environment"], "production");
        assert_eq!(json["agents"][0]["status"], "processing");

        let (_, json) = call(&h.app, Method::GET, "/v1/agents", None, Some(&test_key)).await;
        assert_eq!(json["count"], 1);
        assert_eq!(json["agents"][0]["environment"], "test");
        assert_eq!(json["agents"][0]["status"], "error");
    }

    #[tokio::test]
    async fn test_keys_see_only_test_firings_and_cannot_edit_rules() {
        let h = harness().await;
        let (test_key, _) = h
            .state
            .store
            .create_api_key(&h.tenant_id, "ci", AccessLevel::Test)
            .await
            .unwrap()
            .unwrap();
        let rule_body = json!({
            "name": "slow",
            "condition": {"type": "duration_exceeded", "threshold_ms": 1000}
        });

        let (status, json) = call(
            &h.app,
            Method::POST,
            "/v1/alerts/rules",
            Some(rule_body.clone()),
            Some(&test_key),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["code"], "forbidden");

        let (_, json) =
            call(&h.app, Method::POST, "/v1/alerts/rules", Some(rule_body), Some(&h.key)).await;
        let rule_id = json["rule"]["rule_id"].as_str().unwrap().to_string();
        let rule = h
            .state
            .store
            .get_rule(&h.tenant_id, &rule_id)
            .await
            .unwrap()
            .unwrap();
        let now = Utc::now();
        h.state
            .store
            .try_record_firing(&rule, json!({"duration_ms": 5000}), Some("production"), now)
            .await
            .unwrap()
            .unwrap();
        h.state
            .store
            .try_record_firing(&rule, json!({"duration_ms": 6000}), Some("test"), now)
            .await
            .unwrap()
            .unwrap();

        let (_, json) =
            call(&h.app, Method::GET, "/v1/alerts/history", None, Some(&test_key)).await;
        let firings = json["firings"].as_array().unwrap();
        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0]["environment"], "test");

        let (_, json) = call(&h.app, Method::GET, "/v1/alerts/history", None, Some(&h.key)).await;
        assert_eq!(json["firings"].as_array().unwrap().len(), 2);

        let path = format!("/v1/alerts/rules/{}", rule_id);
        let (status, _) = call(&h.app, Method::DELETE, &path, None, Some(&test_key)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&h.app, Method::GET, &path, None, Some(&test_key)).await;
        assert_eq!(status, StatusCode::OK);
    }
}
