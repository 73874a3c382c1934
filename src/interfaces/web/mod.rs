pub(crate) mod auth;
mod error;
mod handlers;
mod router;

pub use error::ApiError;
pub use router::build_api_router;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::core::config::{LiveConfig, ServerConfig};
use crate::core::ingest::IngestPipeline;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::live::LiveHub;
use crate::core::query::QueryEngine;
use crate::core::store::EventStore;

#[derive(Clone)]
pub struct AppState {
    pub(crate) store: EventStore,
    pub(crate) queries: QueryEngine,
    pub(crate) ingest: IngestPipeline,
    pub(crate) hub: LiveHub,
    pub(crate) live: LiveConfig,
    pub(crate) max_body_bytes: usize,
    pub(crate) cors_origins: Vec<String>,
}

impl AppState {
    pub fn new(
        store: EventStore,
        ingest: IngestPipeline,
        hub: LiveHub,
        live: LiveConfig,
        max_body_bytes: usize,
        cors_origins: Vec<String>,
    ) -> Self {
        Self {
            queries: QueryEngine::new(store.clone()),
            store,
            ingest,
            hub,
            live,
            max_body_bytes,
            cors_origins,
        }
    }
}

pub struct ApiServer {
    state: AppState,
    server: ServerConfig,
    handle: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn new(state: AppState, server: ServerConfig) -> Self {
        Self {
            state,
            server,
            handle: None,
        }
    }
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API server initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = build_api_router(self.state.clone());

        self.handle = Some(tokio::spawn(async move {
            info!("API server listening on http://{}", addr);
            if let Err(e) = axum::serve(listener, app).await {
                error!("API server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API server shutting down...");
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        Ok(())
    }
}
