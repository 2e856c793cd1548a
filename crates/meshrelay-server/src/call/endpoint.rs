//! Per-session negotiation state
//!
//! Two negotiation shapes are accepted:
//!
//! ```text
//! server offers: CREATED -generate_offer-> OFFERING -process_answer-> GATHERING -connected-> CONNECTED
//! client offers: CREATED -process_offer-> ANSWERED -gather-> GATHERING -connected-> CONNECTED
//! ```
//!
//! A negotiated endpoint (GATHERING or CONNECTED) whose relays change is sent
//! back to OFFERING with a fresh offer; a change arriving mid-negotiation is
//! held until the endpoint connects.
//!
//! Any state may be released. State is checked before an engine call and
//! committed after it, so no lock is held across engine latency.

use crate::engine::{
    EndpointEvents, EndpointHandle, EngineEvent, MediaEngine, PipelineHandle,
};
use crate::error::{CallError, Result};
use meshrelay_protocol::{IceCandidateData, SessionId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Created,
    Offering,
    Answered,
    Gathering,
    Connected,
    Released,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Created => "CREATED",
            NegotiationState::Offering => "OFFERING",
            NegotiationState::Answered => "ANSWERED",
            NegotiationState::Gathering => "GATHERING",
            NegotiationState::Connected => "CONNECTED",
            NegotiationState::Released => "RELEASED",
        };
        f.write_str(name)
    }
}

struct EndpointState {
    negotiation: NegotiationState,
    /// Sessions this endpoint relays its media to
    peers: HashSet<SessionId>,
    /// Relays changed during a negotiation; offer again once connected
    renegotiation_pending: bool,
}

struct Endpoint {
    session_id: SessionId,
    handle: EndpointHandle,
    pipeline: PipelineHandle,
    state: Mutex<EndpointState>,
}

pub struct EndpointCoordinator {
    engine: Arc<dyn MediaEngine>,
    endpoints: RwLock<HashMap<SessionId, Arc<Endpoint>>>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl EndpointCoordinator {
    /// `events` receives every candidate and connectivity event raised by the
    /// engine for endpoints created here
    pub fn new(engine: Arc<dyn MediaEngine>, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            engine,
            endpoints: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Allocate the engine endpoint for `session_id` inside `pipeline`.
    /// Returns the existing handle if the session already has one.
    pub async fn create(
        &self,
        session_id: &SessionId,
        pipeline: &PipelineHandle,
    ) -> Result<EndpointHandle> {
        if let Some(existing) = self.endpoints.read().await.get(session_id) {
            return Ok(existing.handle.clone());
        }

        let events = EndpointEvents::new(session_id.clone(), self.events.clone());
        let handle = self
            .engine
            .create_endpoint(pipeline, events)
            .await
            .map_err(|e| CallError::engine(session_id, e))?;

        let endpoint = Arc::new(Endpoint {
            session_id: session_id.clone(),
            handle: handle.clone(),
            pipeline: pipeline.clone(),
            state: Mutex::new(EndpointState {
                negotiation: NegotiationState::Created,
                peers: HashSet::new(),
                renegotiation_pending: false,
            }),
        });
        self.endpoints
            .write()
            .await
            .insert(session_id.clone(), endpoint);

        tracing::info!(
            "Created endpoint {} for session {} in pipeline {}",
            handle,
            session_id,
            pipeline
        );
        Ok(handle)
    }

    /// Server-offers flow: produce the SDP offer for the client
    pub async fn generate_offer(&self, session_id: &SessionId) -> Result<String> {
        let endpoint = self
            .expect_state(session_id, NegotiationState::Created, "generate an offer")
            .await?;

        let sdp_offer = self
            .engine
            .generate_offer(&endpoint.handle)
            .await
            .map_err(|e| CallError::engine(session_id, e))?;

        self.advance(
            &endpoint,
            NegotiationState::Created,
            NegotiationState::Offering,
            "generate an offer",
        )
        .await?;

        tracing::info!("Generated SDP offer for session {}", session_id);
        Ok(sdp_offer)
    }

    /// Client-offers flow: answer the client's SDP offer and start gathering
    pub async fn process_offer(&self, session_id: &SessionId, sdp_offer: &str) -> Result<String> {
        let endpoint = self
            .expect_state(session_id, NegotiationState::Created, "process an offer")
            .await?;

        let sdp_answer = self
            .engine
            .process_offer(&endpoint.handle, sdp_offer)
            .await
            .map_err(|e| CallError::engine(session_id, e))?;

        self.advance(
            &endpoint,
            NegotiationState::Created,
            NegotiationState::Answered,
            "process an offer",
        )
        .await?;
        self.start_gathering(&endpoint, NegotiationState::Answered)
            .await?;

        tracing::info!("Answered SDP offer for session {}", session_id);
        Ok(sdp_answer)
    }

    /// Server-offers flow: apply the client's answer and start gathering
    pub async fn process_answer(&self, session_id: &SessionId, sdp_answer: &str) -> Result<()> {
        let endpoint = self
            .expect_state(session_id, NegotiationState::Offering, "process an answer")
            .await?;

        self.engine
            .process_answer(&endpoint.handle, sdp_answer)
            .await
            .map_err(|e| CallError::engine(session_id, e))?;

        self.start_gathering(&endpoint, NegotiationState::Offering)
            .await?;

        tracing::info!("Applied SDP answer for session {}", session_id);
        Ok(())
    }

    /// Fresh offer after the endpoint's relays changed. `None` when no offer
    /// is due now: a CREATED endpoint's first offer already carries every
    /// relay, and one mid-negotiation is marked pending instead.
    pub async fn renegotiate(&self, session_id: &SessionId) -> Result<Option<String>> {
        let endpoint = self
            .endpoints
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| CallError::EndpointNotFound(session_id.clone()))?;

        {
            let mut state = endpoint.state.lock().await;
            match state.negotiation {
                NegotiationState::Created => return Ok(None),
                NegotiationState::Offering | NegotiationState::Answered => {
                    state.renegotiation_pending = true;
                    return Ok(None);
                }
                NegotiationState::Released => {
                    return Err(CallError::EndpointNotFound(session_id.clone()));
                }
                NegotiationState::Gathering | NegotiationState::Connected => {}
            }
        }

        let sdp_offer = self
            .engine
            .renegotiate(&endpoint.handle)
            .await
            .map_err(|e| CallError::engine(session_id, e))?;

        let mut state = endpoint.state.lock().await;
        match state.negotiation {
            NegotiationState::Gathering | NegotiationState::Connected => {
                tracing::debug!(
                    "Session {}: {} -> {} (renegotiation)",
                    session_id,
                    state.negotiation,
                    NegotiationState::Offering
                );
                state.negotiation = NegotiationState::Offering;
                state.renegotiation_pending = false;
            }
            other => {
                return Err(CallError::InvalidNegotiationState {
                    session_id: session_id.clone(),
                    state: other,
                    operation: "renegotiate",
                });
            }
        }

        tracing::info!("Generated renegotiation offer for session {}", session_id);
        Ok(Some(sdp_offer))
    }

    /// Clear and return the pending-renegotiation mark of a connected endpoint
    pub async fn take_pending_renegotiation(&self, session_id: &SessionId) -> bool {
        let Some(endpoint) = self.endpoints.read().await.get(session_id).cloned() else {
            return false;
        };
        let mut state = endpoint.state.lock().await;
        if state.negotiation != NegotiationState::Connected {
            return false;
        }
        std::mem::take(&mut state.renegotiation_pending)
    }

    /// Hand a remote candidate to the engine. Failures are logged only: a lost
    /// candidate is routine in ICE and never ends the call.
    pub async fn add_ice_candidate(&self, session_id: &SessionId, candidate: &IceCandidateData) {
        let Some(endpoint) = self.endpoints.read().await.get(session_id).cloned() else {
            tracing::warn!("No endpoint for session {}, ignoring ICE candidate", session_id);
            return;
        };

        if endpoint.state.lock().await.negotiation == NegotiationState::Released {
            return;
        }

        match self
            .engine
            .add_ice_candidate(&endpoint.handle, candidate)
            .await
        {
            Ok(()) => tracing::debug!("Added ICE candidate for session {}", session_id),
            Err(e) => tracing::warn!(
                "Failed to add ICE candidate for session {}: {}",
                session_id,
                e
            ),
        }
    }

    /// The engine reports media connectivity. Only meaningful while gathering.
    pub async fn mark_connected(&self, session_id: &SessionId) -> bool {
        let Some(endpoint) = self.endpoints.read().await.get(session_id).cloned() else {
            return false;
        };

        let mut state = endpoint.state.lock().await;
        if state.negotiation != NegotiationState::Gathering {
            tracing::debug!(
                "Ignoring connectivity for session {} in state {}",
                session_id,
                state.negotiation
            );
            return false;
        }
        state.negotiation = NegotiationState::Connected;
        tracing::info!("Session {} is connected", session_id);
        true
    }

    /// Release the endpoint of `session_id`. Safe to call any number of times;
    /// only the first call reaches the engine.
    pub async fn release(&self, session_id: &SessionId) -> bool {
        let Some(endpoint) = self.endpoints.write().await.remove(session_id) else {
            return false;
        };

        {
            let mut state = endpoint.state.lock().await;
            state.negotiation = NegotiationState::Released;
            state.peers.clear();
        }

        let others: Vec<Arc<Endpoint>> = self.endpoints.read().await.values().cloned().collect();
        for other in others {
            other.state.lock().await.peers.remove(session_id);
        }

        if let Err(e) = self.engine.release_endpoint(&endpoint.handle).await {
            tracing::error!(
                "Failed to release endpoint {} of session {}: {}",
                endpoint.handle,
                session_id,
                e
            );
        }

        tracing::info!(
            "Released endpoint {} of session {} (pipeline {})",
            endpoint.handle,
            endpoint.session_id,
            endpoint.pipeline
        );
        true
    }

    /// Release every endpoint; used at shutdown
    pub async fn release_all(&self) -> usize {
        let sessions: Vec<SessionId> = self.endpoints.read().await.keys().cloned().collect();
        let mut released = 0;
        for session_id in sessions {
            if self.release(&session_id).await {
                released += 1;
            }
        }
        released
    }

    pub async fn state_of(&self, session_id: &SessionId) -> Option<NegotiationState> {
        let endpoint = self.endpoints.read().await.get(session_id).cloned()?;
        let negotiation = endpoint.state.lock().await.negotiation;
        Some(negotiation)
    }

    pub async fn handle_of(&self, session_id: &SessionId) -> Option<EndpointHandle> {
        self.endpoints
            .read()
            .await
            .get(session_id)
            .map(|e| e.handle.clone())
    }

    /// Handle of a live (not released) endpoint
    pub async fn live_handle(&self, session_id: &SessionId) -> Option<EndpointHandle> {
        let endpoint = self.endpoints.read().await.get(session_id).cloned()?;
        let negotiation = endpoint.state.lock().await.negotiation;
        (negotiation != NegotiationState::Released).then(|| endpoint.handle.clone())
    }

    pub async fn peers_of(&self, session_id: &SessionId) -> Vec<SessionId> {
        let Some(endpoint) = self.endpoints.read().await.get(session_id).cloned() else {
            return Vec::new();
        };
        let peers = endpoint.state.lock().await.peers.iter().cloned().collect();
        peers
    }

    /// Sessions whose endpoints relay to `sink`
    pub async fn sources_of(&self, sink: &SessionId) -> Vec<SessionId> {
        let endpoints: Vec<Arc<Endpoint>> =
            self.endpoints.read().await.values().cloned().collect();
        let mut sources = Vec::new();
        for endpoint in endpoints {
            if endpoint.state.lock().await.peers.contains(sink) {
                sources.push(endpoint.session_id.clone());
            }
        }
        sources
    }

    pub async fn is_linked(&self, source: &SessionId, sink: &SessionId) -> bool {
        match self.endpoints.read().await.get(source).cloned() {
            Some(endpoint) => endpoint.state.lock().await.peers.contains(sink),
            None => false,
        }
    }

    /// Note that `source` now relays to `sink`
    pub async fn record_link(&self, source: &SessionId, sink: &SessionId) {
        if let Some(endpoint) = self.endpoints.read().await.get(source).cloned() {
            endpoint.state.lock().await.peers.insert(sink.clone());
        }
    }

    pub async fn forget_link(&self, source: &SessionId, sink: &SessionId) {
        if let Some(endpoint) = self.endpoints.read().await.get(source).cloned() {
            endpoint.state.lock().await.peers.remove(sink);
        }
    }

    pub async fn endpoint_count(&self) -> usize {
        self.endpoints.read().await.len()
    }

    async fn expect_state(
        &self,
        session_id: &SessionId,
        expected: NegotiationState,
        operation: &'static str,
    ) -> Result<Arc<Endpoint>> {
        let endpoint = self
            .endpoints
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| CallError::EndpointNotFound(session_id.clone()))?;

        let state = endpoint.state.lock().await.negotiation;
        if state != expected {
            return Err(CallError::InvalidNegotiationState {
                session_id: session_id.clone(),
                state,
                operation,
            });
        }
        Ok(endpoint)
    }

    async fn advance(
        &self,
        endpoint: &Endpoint,
        from: NegotiationState,
        to: NegotiationState,
        operation: &'static str,
    ) -> Result<()> {
        let mut state = endpoint.state.lock().await;
        if state.negotiation != from {
            // Released while the engine call was in flight
            return Err(CallError::InvalidNegotiationState {
                session_id: endpoint.session_id.clone(),
                state: state.negotiation,
                operation,
            });
        }
        state.negotiation = to;
        tracing::debug!("Session {}: {} -> {}", endpoint.session_id, from, to);
        Ok(())
    }

    async fn start_gathering(&self, endpoint: &Endpoint, from: NegotiationState) -> Result<()> {
        // Committed first so a connectivity event raised during gathering
        // finds the endpoint already in GATHERING
        self.advance(endpoint, from, NegotiationState::Gathering, "start gathering")
            .await?;

        self.engine
            .gather_ice_candidates(&endpoint.handle)
            .await
            .map_err(|e| CallError::engine(&endpoint.session_id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;

    const OFFER: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    struct Fixture {
        engine: Arc<MemoryEngine>,
        coordinator: EndpointCoordinator,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        pipeline: PipelineHandle,
    }

    async fn fixture() -> Fixture {
        let engine = Arc::new(MemoryEngine::new());
        let (tx, events) = mpsc::unbounded_channel();
        let coordinator = EndpointCoordinator::new(engine.clone(), tx);
        let pipeline = engine.create_pipeline().await.unwrap();
        Fixture {
            engine,
            coordinator,
            events,
            pipeline,
        }
    }

    #[tokio::test]
    async fn server_offers_flow() {
        let mut f = fixture().await;
        let s = SessionId::from("s1");
        f.coordinator.create(&s, &f.pipeline).await.unwrap();
        assert_eq!(f.coordinator.state_of(&s).await, Some(NegotiationState::Created));

        let offer = f.coordinator.generate_offer(&s).await.unwrap();
        assert!(offer.starts_with("v=0"));
        assert_eq!(f.coordinator.state_of(&s).await, Some(NegotiationState::Offering));

        f.coordinator.process_answer(&s, OFFER).await.unwrap();
        assert_eq!(f.coordinator.state_of(&s).await, Some(NegotiationState::Gathering));

        // Candidate is forwarded with its session, then connectivity arrives
        match f.events.recv().await {
            Some(EngineEvent::IceCandidate { session_id, .. }) => assert_eq!(session_id, s),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            f.events.recv().await,
            Some(EngineEvent::Connected { session_id: s.clone() })
        );

        assert!(f.coordinator.mark_connected(&s).await);
        assert_eq!(f.coordinator.state_of(&s).await, Some(NegotiationState::Connected));
    }

    #[tokio::test]
    async fn client_offers_flow() {
        let f = fixture().await;
        let s = SessionId::from("s1");
        f.coordinator.create(&s, &f.pipeline).await.unwrap();

        let answer = f.coordinator.process_offer(&s, OFFER).await.unwrap();
        assert!(answer.starts_with("v=0"));
        assert_eq!(f.coordinator.state_of(&s).await, Some(NegotiationState::Gathering));

        assert!(f.coordinator.mark_connected(&s).await);
        assert!(!f.coordinator.mark_connected(&s).await);
        assert_eq!(f.coordinator.state_of(&s).await, Some(NegotiationState::Connected));
    }

    #[tokio::test]
    async fn answer_before_offer_is_rejected() {
        let f = fixture().await;
        let s = SessionId::from("s1");
        f.coordinator.create(&s, &f.pipeline).await.unwrap();

        let err = f.coordinator.process_answer(&s, OFFER).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::InvalidNegotiationState {
                state: NegotiationState::Created,
                ..
            }
        ));
        assert_eq!(f.coordinator.state_of(&s).await, Some(NegotiationState::Created));
    }

    #[tokio::test]
    async fn second_offer_is_rejected() {
        let f = fixture().await;
        let s = SessionId::from("s1");
        f.coordinator.create(&s, &f.pipeline).await.unwrap();
        f.coordinator.process_offer(&s, OFFER).await.unwrap();

        assert!(matches!(
            f.coordinator.process_offer(&s, OFFER).await,
            Err(CallError::InvalidNegotiationState { .. })
        ));
        assert!(matches!(
            f.coordinator.generate_offer(&s).await,
            Err(CallError::InvalidNegotiationState { .. })
        ));
        assert_eq!(f.coordinator.state_of(&s).await, Some(NegotiationState::Gathering));
    }

    #[tokio::test]
    async fn engine_failure_is_attributed_and_keeps_state() {
        let f = fixture().await;
        let s = SessionId::from("s1");
        f.coordinator.create(&s, &f.pipeline).await.unwrap();

        match f.coordinator.process_offer(&s, "not sdp").await {
            Err(CallError::Engine { session_id, .. }) => assert_eq!(session_id, s),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.coordinator.state_of(&s).await, Some(NegotiationState::Created));
    }

    #[tokio::test]
    async fn bad_candidate_changes_nothing() {
        let f = fixture().await;
        let s = SessionId::from("s1");
        let handle = f.coordinator.create(&s, &f.pipeline).await.unwrap();
        f.coordinator.generate_offer(&s).await.unwrap();

        let bad = IceCandidateData {
            candidate: "garbage".to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
        };
        f.coordinator.add_ice_candidate(&s, &bad).await;
        f.coordinator
            .add_ice_candidate(&SessionId::from("nobody"), &bad)
            .await;
        assert_eq!(f.coordinator.state_of(&s).await, Some(NegotiationState::Offering));
        assert_eq!(f.engine.remote_candidates(&handle).await, 0);

        let good = IceCandidateData {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        f.coordinator.add_ice_candidate(&s, &good).await;
        assert_eq!(f.engine.remote_candidates(&handle).await, 1);
        assert_eq!(f.coordinator.state_of(&s).await, Some(NegotiationState::Offering));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let f = fixture().await;
        let s = SessionId::from("s1");
        f.coordinator.create(&s, &f.pipeline).await.unwrap();

        assert!(f.coordinator.release(&s).await);
        assert!(!f.coordinator.release(&s).await);
        assert_eq!(f.engine.stats().endpoints_released, 1);
        assert_eq!(f.coordinator.state_of(&s).await, None);
        assert!(matches!(
            f.coordinator.generate_offer(&s).await,
            Err(CallError::EndpointNotFound(_))
        ));
    }

    #[tokio::test]
    async fn release_scrubs_peer_sets() {
        let f = fixture().await;
        let a = SessionId::from("a");
        let b = SessionId::from("b");
        f.coordinator.create(&a, &f.pipeline).await.unwrap();
        f.coordinator.create(&b, &f.pipeline).await.unwrap();
        f.coordinator.record_link(&a, &b).await;
        f.coordinator.record_link(&b, &a).await;

        f.coordinator.release(&b).await;
        assert!(f.coordinator.peers_of(&a).await.is_empty());
    }

    #[tokio::test]
    async fn create_is_idempotent_per_session() {
        let f = fixture().await;
        let s = SessionId::from("s1");
        let first = f.coordinator.create(&s, &f.pipeline).await.unwrap();
        let second = f.coordinator.create(&s, &f.pipeline).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.engine.stats().endpoints_created, 1);
    }

    #[tokio::test]
    async fn renegotiation_depends_on_state() {
        let f = fixture().await;
        let s = SessionId::from("s1");
        f.coordinator.create(&s, &f.pipeline).await.unwrap();

        // First offer still to come
        assert_eq!(f.coordinator.renegotiate(&s).await.unwrap(), None);
        assert_eq!(f.coordinator.state_of(&s).await, Some(NegotiationState::Created));

        // Mid-negotiation: held until connected
        f.coordinator.generate_offer(&s).await.unwrap();
        assert_eq!(f.coordinator.renegotiate(&s).await.unwrap(), None);
        assert!(!f.coordinator.take_pending_renegotiation(&s).await);

        f.coordinator.process_answer(&s, OFFER).await.unwrap();
        assert!(f.coordinator.mark_connected(&s).await);
        assert!(f.coordinator.take_pending_renegotiation(&s).await);
        assert!(!f.coordinator.take_pending_renegotiation(&s).await);

        let offer = f.coordinator.renegotiate(&s).await.unwrap();
        assert!(offer.is_some_and(|sdp| sdp.starts_with("v=0")));
        assert_eq!(f.coordinator.state_of(&s).await, Some(NegotiationState::Offering));

        f.coordinator.process_answer(&s, OFFER).await.unwrap();
        assert!(f.coordinator.mark_connected(&s).await);
        assert_eq!(f.coordinator.state_of(&s).await, Some(NegotiationState::Connected));

        f.coordinator.release(&s).await;
        assert!(matches!(
            f.coordinator.renegotiate(&s).await,
            Err(CallError::EndpointNotFound(_))
        ));
    }
}
