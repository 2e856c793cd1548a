use crate::call::CallService;
use crate::engine::MediaEngine;
use crate::ws::SignalingRouter;
use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use meshrelay_protocol::RoomId;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which media engine adapter to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    WebRtc,
    Memory,
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webrtc" => Ok(EngineKind::WebRtc),
            "memory" => Ok(EngineKind::Memory),
            other => bail!("Unknown media engine '{}', expected 'webrtc' or 'memory'", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    pub engine: EngineKind,
    /// Room used by `join` messages without a `roomId`
    pub default_room: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl FromStr for TurnServer {
    type Err = anyhow::Error;

    /// `url|username|credential`
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.trim().splitn(3, '|');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(url), Some(username), Some(credential)) if !url.is_empty() => Ok(TurnServer {
                url: url.to_string(),
                username: username.to_string(),
                credential: credential.to_string(),
            }),
            _ => bail!("TURN server entry must be url|username|credential, got '{}'", s),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let stun_servers = std::env::var("STUN_SERVERS")
            .map(|s| split_list(&s).map(String::from).collect())
            .unwrap_or_else(|_| vec!["stun:stun.l.google.com:19302".to_string()]);

        let turn_servers = match std::env::var("TURN_SERVERS") {
            Ok(s) => split_list(&s)
                .map(TurnServer::from_str)
                .collect::<anyhow::Result<Vec<_>>>()
                .context("Invalid TURN_SERVERS")?,
            Err(_) => Vec::new(),
        };

        let engine = match std::env::var("MESHRELAY_ENGINE") {
            Ok(s) => s.parse().context("Invalid MESHRELAY_ENGINE")?,
            Err(_) => EngineKind::WebRtc,
        };

        let default_room = std::env::var("DEFAULT_ROOM")
            .ok()
            .filter(|room| !room.trim().is_empty())
            .unwrap_or_else(|| "default-room".to_string());

        Ok(Config {
            bind_address,
            stun_servers,
            turn_servers,
            engine,
            default_room: RoomId::new(default_room),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_address: "0.0.0.0:8080".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            engine: EngineKind::WebRtc,
            default_room: RoomId::from("default-room"),
        }
    }
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|entry| !entry.is_empty())
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub router: Arc<SignalingRouter>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire the call service to `engine` and start relaying engine events.
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config, engine: Arc<dyn MediaEngine>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let service = Arc::new(CallService::new(engine, events_tx));
        let router = Arc::new(SignalingRouter::new(service, config.default_room.clone()));
        router.spawn_event_pump(events_rx);

        Self {
            config,
            router,
            started_at: Utc::now(),
        }
    }

    pub fn service(&self) -> &Arc<CallService> {
        self.router.service()
    }
}
