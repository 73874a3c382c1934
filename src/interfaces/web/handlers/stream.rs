use axum::{
    Extension,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::super::AppState;
use crate::core::live::{ClientMessage, OutboundQueue, ServerMessage};
use crate::core::model::TenantContext;

pub async fn stream_endpoint(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, ctx))
}

/// Applies one client frame. Anything unparseable is answered with an
/// `error` message and the connection stays open.
async fn handle_client_text(
    state: &AppState,
    id: u64,
    queue: &OutboundQueue,
    missed_pings: &AtomicU32,
    text: &str,
) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { channels, filters }) => {
            state.hub.subscribe(id, channels, filters).await;
        }
        Ok(ClientMessage::Unsubscribe) => state.hub.unsubscribe(id).await,
        Ok(ClientMessage::Pong) => missed_pings.store(0, Ordering::Relaxed),
        Err(e) => queue.push(ServerMessage::error(
            "invalid_message",
            format!("could not parse client message: {}", e),
        )),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, ctx: TenantContext) {
    let handle = state
        .hub
        .register(&ctx.tenant_id, ctx.forced_environment())
        .await;
    let id = handle.id;
    let queue = handle.queue;
    info!(
        "Live stream {} opened for tenant {} ({} connected)",
        id,
        ctx.tenant_id,
        state.hub.subscriber_count().await
    );

    let (mut sender, mut receiver) = socket.split();
    let missed_pings = Arc::new(AtomicU32::new(0));
    let ping_every = Duration::from_secs(state.live.ping_interval_seconds.max(1));
    let max_missed = state.live.max_missed_pings.max(1);

    let mut writer = {
        let queue = queue.clone();
        let missed_pings = missed_pings.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    next = queue.pop() => {
                        let Some(message) = next else { break };
                        let text = match serde_json::to_string(&message) {
                            Ok(t) => t,
                            Err(e) => {
                                warn!("Failed to encode live message: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if missed_pings.fetch_add(1, Ordering::Relaxed) >= max_missed {
                            info!("Live stream {} missed {} pings, closing", id, max_missed);
                            let _ = sender.send(Message::Close(None)).await;
                            break;
                        }
                        queue.push(ServerMessage::Ping { ts: Utc::now().timestamp_millis() });
                    }
                }
            }
        })
    };

    let reader = async {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => {
                    handle_client_text(&state, id, &queue, &missed_pings, text.as_str()).await;
                }
                Message::Pong(_) => missed_pings.store(0, Ordering::Relaxed),
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = &mut writer => {}
        _ = reader => {}
    }

    state.hub.remove(id).await;
    writer.abort();
    debug!("Live stream {} closed ({} messages shed)", id, queue.dropped());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{IngestConfig, LiveConfig};
    use crate::core::ingest::IngestPipeline;
    use crate::core::live::{Channel, LiveHub};
    use crate::core::store::test_event_store;
    use tokio::sync::mpsc;

    fn state() -> AppState {
        let store = test_event_store();
        let (live_tx, _live_rx) = mpsc::channel(8);
        let (alert_tx, _alert_rx) = mpsc::channel(8);
        let ingest = IngestPipeline::new(store.clone(), IngestConfig::default(), live_tx, alert_tx);
        AppState::new(
            store,
            ingest,
            LiveHub::new(16),
            LiveConfig::default(),
            1024 * 1024,
            vec![],
        )
    }

    #[tokio::test]
    async fn subscribe_frame_is_acked() {
        let state = state();
        let handle = state.hub.register("t1", None).await;
        let missed = AtomicU32::new(2);

        handle_client_text(
            &state,
            handle.id,
            &handle.queue,
            &missed,
            r#"{"action":"subscribe","channels":["agents"]}"#,
        )
        .await;
        match handle.queue.pop().await {
            Some(ServerMessage::Subscribed { channels, .. }) => {
                assert_eq!(channels, vec![Channel::Agents])
            }
            other => panic!("expected ack, got {:?}", other),
        }

        handle_client_text(&state, handle.id, &handle.queue, &missed, r#"{"action":"pong"}"#).await;
        assert_eq!(missed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn garbage_frame_gets_error_reply() {
        let state = state();
        let handle = state.hub.register("t1", None).await;
        let missed = AtomicU32::new(0);

        handle_client_text(&state, handle.id, &handle.queue, &missed, "{\"action\":\"dance\"}").await;
        match handle.queue.pop().await {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, "invalid_message"),
            other => panic!("expected error, got {:?}", other),
        }
    }
}
