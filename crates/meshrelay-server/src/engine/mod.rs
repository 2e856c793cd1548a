//! Media engine boundary
//!
//! The orchestration layer only ever talks to a [`MediaEngine`]. Pipelines and
//! endpoints are opaque handles owned by the engine; asynchronous engine events
//! (discovered ICE candidates, connectivity, renegotiation requests) come back
//! through the [`EndpointEvents`] sink handed over at endpoint creation.

mod memory;
mod rtc;
mod track_router;

pub use memory::{MemoryEngine, MemoryEngineStats};
pub use track_router::TrackRouter;
pub use rtc::WebRtcEngine;

use async_trait::async_trait;
use meshrelay_protocol::{IceCandidateData, SessionId};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Media engine unreachable: {0}")]
    Unavailable(String),

    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(PipelineHandle),

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(EndpointHandle),

    #[error("Invalid session description: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Media engine call failed: {0}")]
    Call(String),
}

impl From<::webrtc::Error> for EngineError {
    fn from(e: ::webrtc::Error) -> Self {
        EngineError::Call(e.to_string())
    }
}

/// Engine-side resource grouping the endpoints of one room
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineHandle(String);

impl PipelineHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Engine-side media relay point of one participant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointHandle(String);

impl EndpointHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event raised by the engine on behalf of one session's endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    IceCandidate {
        session_id: SessionId,
        candidate: IceCandidateData,
    },
    Connected {
        session_id: SessionId,
    },
    /// The endpoint's media set changed after it was negotiated; the client
    /// needs a fresh offer to see it
    RenegotiationNeeded {
        session_id: SessionId,
    },
}

/// Per-endpoint handle the engine uses to report events.
///
/// Sends never block and never fail loudly: once the receiving side is gone
/// the event is dropped with a debug log.
#[derive(Debug, Clone)]
pub struct EndpointEvents {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EndpointEvents {
    pub fn new(session_id: SessionId, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn ice_candidate(&self, candidate: IceCandidateData) {
        self.emit(EngineEvent::IceCandidate {
            session_id: self.session_id.clone(),
            candidate,
        });
    }

    pub fn connected(&self) {
        self.emit(EngineEvent::Connected {
            session_id: self.session_id.clone(),
        });
    }

    pub fn renegotiation_needed(&self) {
        self.emit(EngineEvent::RenegotiationNeeded {
            session_id: self.session_id.clone(),
        });
    }

    fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!(
                "Dropping engine event for {}: event channel closed",
                self.session_id
            );
        }
    }
}

/// Typed interface to the media relay engine
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Short name shown in status output
    fn name(&self) -> &'static str;

    async fn create_pipeline(&self) -> Result<PipelineHandle, EngineError>;

    async fn release_pipeline(&self, pipeline: &PipelineHandle) -> Result<(), EngineError>;

    async fn create_endpoint(
        &self,
        pipeline: &PipelineHandle,
        events: EndpointEvents,
    ) -> Result<EndpointHandle, EngineError>;

    async fn release_endpoint(&self, endpoint: &EndpointHandle) -> Result<(), EngineError>;

    async fn generate_offer(&self, endpoint: &EndpointHandle) -> Result<String, EngineError>;

    async fn process_offer(
        &self,
        endpoint: &EndpointHandle,
        sdp_offer: &str,
    ) -> Result<String, EngineError>;

    async fn process_answer(
        &self,
        endpoint: &EndpointHandle,
        sdp_answer: &str,
    ) -> Result<(), EngineError>;

    /// New offer for an endpoint that already completed a negotiation
    async fn renegotiate(&self, endpoint: &EndpointHandle) -> Result<String, EngineError>;

    async fn gather_ice_candidates(&self, endpoint: &EndpointHandle) -> Result<(), EngineError>;

    async fn add_ice_candidate(
        &self,
        endpoint: &EndpointHandle,
        candidate: &IceCandidateData,
    ) -> Result<(), EngineError>;

    /// Relay media from `source` to `sink` (one direction). Raises
    /// `RenegotiationNeeded` for `sink` when its media set changes after
    /// negotiation.
    async fn connect(
        &self,
        source: &EndpointHandle,
        sink: &EndpointHandle,
    ) -> Result<(), EngineError>;

    /// Remove a `source -> sink` relay
    async fn disconnect(
        &self,
        source: &EndpointHandle,
        sink: &EndpointHandle,
    ) -> Result<(), EngineError>;

    /// Whether links must be torn down explicitly before an endpoint is
    /// released. Engines that drop links together with the endpoint return
    /// `false`.
    fn requires_explicit_unlink(&self) -> bool {
        false
    }
}
