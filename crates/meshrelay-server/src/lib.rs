//! Meshrelay Server Library
//!
//! Signaling and mesh orchestration for multi-party WebRTC rooms. Exposed as a
//! library for testing and embedding.

pub mod api;
pub mod call;
pub mod engine;
pub mod error;
pub mod state;
pub mod ws;

use anyhow::Result;
use engine::{MediaEngine, MemoryEngine, WebRtcEngine};
use state::{AppState, Config, EngineKind};
use std::sync::Arc;

/// Build the media engine selected by `config`
pub fn build_engine(config: &Config) -> Result<Arc<dyn MediaEngine>> {
    let engine: Arc<dyn MediaEngine> = match config.engine {
        EngineKind::WebRtc => {
            let turn_servers = config
                .turn_servers
                .iter()
                .map(|t| (t.url.clone(), t.username.clone(), t.credential.clone()))
                .collect();
            Arc::new(WebRtcEngine::new(config.stun_servers.clone(), turn_servers)?)
        }
        EngineKind::Memory => Arc::new(MemoryEngine::new()),
    };
    Ok(engine)
}

/// Create and configure the server application
pub async fn create_app(config: Config) -> Result<(axum::Router, AppState)> {
    let engine = build_engine(&config)?;
    Ok(create_app_with_engine(config, engine))
}

/// Same as [`create_app`] with an engine supplied by the caller
pub fn create_app_with_engine(
    config: Config,
    engine: Arc<dyn MediaEngine>,
) -> (axum::Router, AppState) {
    let app_state = AppState::new(config, engine);
    let router = api::create_router(app_state.clone());
    (router, app_state)
}
