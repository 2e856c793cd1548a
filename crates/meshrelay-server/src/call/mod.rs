//! Call orchestration
//!
//! [`CallService`] ties room bookkeeping, per-session negotiation and mesh
//! wiring together. It is the only thing the signaling layer talks to.

mod endpoint;
mod mesh;
mod registry;

pub use endpoint::{EndpointCoordinator, NegotiationState};
pub use mesh::{MeshConnector, MeshReport};
pub use registry::{JoinedRoom, RoomRegistry};

use crate::engine::{EngineEvent, MediaEngine};
use crate::error::{CallError, Result};
use meshrelay_protocol::{IceCandidateData, RoomId, SessionId};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a successful join changed
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room_id: RoomId,
    /// Members that were already in the room
    pub existing_members: Vec<SessionId>,
    /// Members the session was wired to; they are told about the newcomer
    pub peers: Vec<SessionId>,
    /// The session was already in this room; nothing was created
    pub rejoined: bool,
    pub mesh: MeshReport,
}

/// What a leave changed
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub room_id: RoomId,
    /// Members still in the room afterwards
    pub remaining: Vec<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub active_rooms: usize,
    pub active_endpoints: usize,
    pub engine: &'static str,
}

pub struct CallService {
    engine: Arc<dyn MediaEngine>,
    rooms: RoomRegistry,
    endpoints: Arc<EndpointCoordinator>,
    mesh: MeshConnector,
}

impl CallService {
    /// Engine events for every endpoint created by this service are sent to
    /// `events`
    pub fn new(engine: Arc<dyn MediaEngine>, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        let endpoints = Arc::new(EndpointCoordinator::new(engine.clone(), events));
        Self {
            rooms: RoomRegistry::new(engine.clone()),
            mesh: MeshConnector::new(engine.clone(), endpoints.clone()),
            endpoints,
            engine,
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Join `room_id`: room and pipeline first, then the session's endpoint,
    /// then links to every other member. A failed endpoint allocation undoes
    /// the room membership.
    pub async fn join(&self, session_id: &SessionId, room_id: &RoomId) -> Result<JoinOutcome> {
        let joined = self.rooms.join_room(session_id, room_id).await?;

        if let Err(e) = self.endpoints.create(session_id, &joined.pipeline).await {
            tracing::error!(
                "Failed to create endpoint for session {} in room {}: {}",
                session_id,
                room_id,
                e
            );
            if !joined.rejoined {
                self.rooms.leave_room(session_id).await;
            }
            return Err(e);
        }

        if joined.rejoined {
            return Ok(JoinOutcome {
                room_id: joined.room_id,
                peers: joined.existing_members.clone(),
                existing_members: joined.existing_members,
                rejoined: true,
                mesh: MeshReport::default(),
            });
        }

        // Members are read again once the endpoint exists: of two concurrent
        // joiners, whichever endpoint came second finds the first one live
        let peers: Vec<SessionId> = self
            .rooms
            .members(room_id)
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|member| member != session_id)
            .collect();
        let mesh = self
            .mesh
            .attach_new_participant(room_id, session_id, &peers)
            .await;

        Ok(JoinOutcome {
            room_id: joined.room_id,
            existing_members: joined.existing_members,
            peers,
            rejoined: false,
            mesh,
        })
    }

    /// Leave the current room. Returns `None` if the session was in no room,
    /// so a second leave (or a disconnect after a leave) does nothing.
    pub async fn leave(&self, session_id: &SessionId) -> Option<LeaveOutcome> {
        let room_id = self.rooms.room_of(session_id).await?;

        self.mesh.detach_participant(&room_id, session_id).await;
        self.endpoints.release(session_id).await;
        let room_id = self.rooms.leave_room(session_id).await?;

        let remaining = self.rooms.members(&room_id).await.unwrap_or_default();
        Some(LeaveOutcome { room_id, remaining })
    }

    /// Server-offers flow: SDP offer for the session's endpoint
    pub async fn start_communication(&self, session_id: &SessionId) -> Result<String> {
        self.require_room(session_id).await?;
        self.endpoints.generate_offer(session_id).await
    }

    /// Client-offers flow: SDP answer for the client's offer
    pub async fn process_offer(&self, session_id: &SessionId, sdp_offer: &str) -> Result<String> {
        self.require_room(session_id).await?;
        self.endpoints.process_offer(session_id, sdp_offer).await
    }

    pub async fn process_answer(&self, session_id: &SessionId, sdp_answer: &str) -> Result<()> {
        self.require_room(session_id).await?;
        self.endpoints.process_answer(session_id, sdp_answer).await
    }

    pub async fn add_ice_candidate(&self, session_id: &SessionId, candidate: &IceCandidateData) {
        self.endpoints.add_ice_candidate(session_id, candidate).await;
    }

    /// The engine reports the session's media path is up
    pub async fn endpoint_connected(&self, session_id: &SessionId) -> bool {
        self.endpoints.mark_connected(session_id).await
    }

    /// Fresh offer for a session whose relays changed after negotiation, if
    /// one is due now
    pub async fn renegotiate(&self, session_id: &SessionId) -> Result<Option<String>> {
        self.endpoints.renegotiate(session_id).await
    }

    /// A relay change was held back during negotiation and the session has
    /// just connected
    pub async fn take_pending_renegotiation(&self, session_id: &SessionId) -> bool {
        self.endpoints.take_pending_renegotiation(session_id).await
    }

    pub async fn negotiation_state(&self, session_id: &SessionId) -> Option<NegotiationState> {
        self.endpoints.state_of(session_id).await
    }

    pub async fn status(&self) -> ServiceStatus {
        ServiceStatus {
            active_rooms: self.rooms.room_count().await,
            active_endpoints: self.endpoints.endpoint_count().await,
            engine: self.engine.name(),
        }
    }

    /// Release every endpoint and pipeline
    pub async fn shutdown(&self) {
        let endpoints = self.endpoints.release_all().await;
        let pipelines = self.rooms.shutdown().await;
        tracing::info!(
            "Call service shut down: released {} endpoints and {} pipelines",
            endpoints,
            pipelines
        );
    }

    async fn require_room(&self, session_id: &SessionId) -> Result<()> {
        match self.rooms.room_of(session_id).await {
            Some(_) => Ok(()),
            None => Err(CallError::NotInRoom(session_id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use std::time::Duration;

    fn service(engine: Arc<MemoryEngine>) -> (CallService, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CallService::new(engine, tx), rx)
    }

    #[tokio::test]
    async fn room_lifecycle_balances_pipelines() {
        let engine = Arc::new(MemoryEngine::new());
        let (service, _events) = service(engine.clone());
        let room = RoomId::from("r1");
        let sessions: Vec<SessionId> = (0..4).map(|i| SessionId::new(format!("s{}", i))).collect();

        for (i, session) in sessions.iter().enumerate() {
            let outcome = service.join(session, &room).await.unwrap();
            assert_eq!(outcome.existing_members.len(), i);
            assert!(outcome.mesh.is_complete());
        }
        assert_eq!(engine.stats().pipelines_created, 1);
        assert_eq!(engine.link_count().await, 12);

        for (i, session) in sessions.iter().enumerate() {
            let outcome = service.leave(session).await.unwrap();
            assert_eq!(outcome.remaining.len(), sessions.len() - i - 1);
            assert!(service.leave(session).await.is_none());
        }

        let stats = engine.stats();
        assert_eq!(stats.pipelines_released, stats.pipelines_created);
        assert_eq!(stats.endpoints_released, 4);
        assert_eq!(service.status().await.active_rooms, 0);
        assert_eq!(engine.link_count().await, 0);
    }

    #[tokio::test]
    async fn endpoint_failure_rolls_back_membership() {
        let engine = Arc::new(MemoryEngine::new());
        let (service, _events) = service(engine.clone());
        let s = SessionId::from("s1");

        engine.fail_endpoint_creation(true);
        assert!(matches!(
            service.join(&s, &RoomId::from("r1")).await,
            Err(CallError::Engine { .. })
        ));
        assert!(matches!(
            service.start_communication(&s).await,
            Err(CallError::NotInRoom(_))
        ));
        assert_eq!(engine.live_pipelines().await, 0);

        engine.fail_endpoint_creation(false);
        service.join(&s, &RoomId::from("r1")).await.unwrap();
        assert_eq!(service.status().await.active_endpoints, 1);
    }

    #[tokio::test]
    async fn negotiation_requires_room() {
        let engine = Arc::new(MemoryEngine::new());
        let (service, _events) = service(engine);
        let s = SessionId::from("s1");

        assert!(matches!(
            service.start_communication(&s).await,
            Err(CallError::NotInRoom(_))
        ));
        assert!(matches!(
            service.process_answer(&s, "v=0").await,
            Err(CallError::NotInRoom(_))
        ));
    }

    #[tokio::test]
    async fn rejoin_creates_nothing() {
        let engine = Arc::new(MemoryEngine::new());
        let (service, _events) = service(engine.clone());
        let room = RoomId::from("r1");
        let a = SessionId::from("a");
        let b = SessionId::from("b");
        service.join(&a, &room).await.unwrap();
        service.join(&b, &room).await.unwrap();
        let links = engine.link_count().await;

        let outcome = service.join(&b, &room).await.unwrap();
        assert!(outcome.rejoined);
        assert_eq!(outcome.existing_members, vec![a.clone()]);
        assert_eq!(engine.stats().endpoints_created, 2);
        assert_eq!(engine.link_count().await, links);

        assert!(matches!(
            service.join(&b, &RoomId::from("r2")).await,
            Err(CallError::AlreadyInRoom { .. })
        ));
    }

    #[tokio::test]
    async fn connected_event_completes_negotiation() {
        let engine = Arc::new(MemoryEngine::new());
        let (service, mut events) = service(engine);
        let s = SessionId::from("s1");
        service.join(&s, &RoomId::from("r1")).await.unwrap();

        service.start_communication(&s).await.unwrap();
        service.process_answer(&s, "v=0\r\n").await.unwrap();

        while let Some(event) = events.recv().await {
            if let EngineEvent::Connected { session_id } = event {
                assert!(service.endpoint_connected(&session_id).await);
                break;
            }
        }
        assert_eq!(
            service.negotiation_state(&s).await,
            Some(NegotiationState::Connected)
        );
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let engine = Arc::new(MemoryEngine::new());
        let (service, _events) = service(engine.clone());
        for (session, room) in [("a", "r1"), ("b", "r1"), ("c", "r2")] {
            service
                .join(&SessionId::from(session), &RoomId::from(room))
                .await
                .unwrap();
        }

        service.shutdown().await;
        assert_eq!(engine.live_pipelines().await, 0);
        assert_eq!(engine.live_endpoints().await, 0);
        assert_eq!(
            service.status().await,
            ServiceStatus {
                active_rooms: 0,
                active_endpoints: 0,
                engine: "memory",
            }
        );
    }

    #[tokio::test]
    async fn concurrent_joiners_link_to_each_other() {
        let engine = Arc::new(MemoryEngine::new());
        engine
            .delay_endpoint_creation(SessionId::from("slow"), Duration::from_millis(200))
            .await;
        let (service, _events) = service(engine.clone());
        let service = Arc::new(service);
        let room = RoomId::from("r1");

        let slow = tokio::spawn({
            let service = service.clone();
            let room = room.clone();
            async move { service.join(&SessionId::from("slow"), &room).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fast = service.join(&SessionId::from("fast"), &room).await.unwrap();
        let slow = slow.await.unwrap().unwrap();

        // "fast" found "slow" before its endpoint existed
        assert_eq!(fast.existing_members, vec![SessionId::from("slow")]);
        assert_eq!(fast.mesh.skipped, vec![SessionId::from("slow")]);

        assert!(slow.existing_members.is_empty());
        assert_eq!(slow.peers, vec![SessionId::from("fast")]);
        assert!(slow.mesh.is_complete());
        assert_eq!(slow.mesh.linked.len(), 2);
        assert_eq!(engine.link_count().await, 2);
    }

    #[tokio::test]
    async fn newcomer_triggers_renegotiation_of_connected_member() {
        let engine = Arc::new(MemoryEngine::new());
        let (service, mut events) = service(engine);
        let room = RoomId::from("r1");
        let a = SessionId::from("a");
        service.join(&a, &room).await.unwrap();
        service.start_communication(&a).await.unwrap();
        service.process_answer(&a, "v=0\r\n").await.unwrap();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::Connected { session_id } = event {
                service.endpoint_connected(&session_id).await;
            }
        }
        assert_eq!(
            service.negotiation_state(&a).await,
            Some(NegotiationState::Connected)
        );

        service.join(&SessionId::from("b"), &room).await.unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::RenegotiationNeeded { session_id: a.clone() }
        );
        assert!(events.try_recv().is_err());

        let offer = service.renegotiate(&a).await.unwrap();
        assert!(offer.is_some());
        assert_eq!(
            service.negotiation_state(&a).await,
            Some(NegotiationState::Offering)
        );
        assert_eq!(
            service.renegotiate(&SessionId::from("b")).await.unwrap(),
            None
        );
    }
}
