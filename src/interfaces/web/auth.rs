use axum::{
    body::Body,
    extract::{Query, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

use super::{ApiError, AppState};

const STREAM_PATH: &str = "/v1/stream";

#[derive(Debug, Deserialize)]
struct TokenParams {
    token: Option<String>,
}

/// Browsers cannot set headers on a WebSocket handshake, so the stream
/// endpoint also accepts the key as `?token=`.
fn query_token(req: &Request<Body>) -> Option<String> {
    if req.uri().path() != STREAM_PATH {
        return None;
    }
    let Query(params) = Query::<TokenParams>::try_from_uri(req.uri()).ok()?;
    params.token.filter(|t| !t.is_empty())
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let raw_key = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .or_else(|| query_token(&req));

    let Some(raw_key) = raw_key else {
        return ApiError::Unauthorized(
            "missing or invalid Authorization header, use: Bearer <api key>".to_string(),
        )
        .into_response();
    };

    match state.store.resolve_api_key(&raw_key).await {
        Ok(Some(ctx)) => {
            debug!(
                "Request {} {} authenticated as key {}",
                req.method(),
                req.uri().path(),
                ctx.key_id
            );
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Ok(None) => ApiError::Unauthorized("API key is unknown or revoked".to_string())
            .into_response(),
        Err(e) => ApiError::Internal(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn stream_token_is_percent_decoded() {
        let req = request("/v1/stream?channels=events&token=hw_live_a%2Bb%3Dc");
        assert_eq!(query_token(&req).as_deref(), Some("hw_live_a+b=c"));
    }

    #[test]
    fn token_is_only_read_on_the_stream_path() {
        assert!(query_token(&request("/v1/agents?token=hw_live_abc")).is_none());
        assert!(query_token(&request("/v1/stream?token=")).is_none());
        assert!(query_token(&request("/v1/stream")).is_none());
    }
}
