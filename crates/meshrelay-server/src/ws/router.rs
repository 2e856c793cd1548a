//! Signaling dispatch
//!
//! Turns inbound client messages into [`CallService`] calls and sends the
//! replies and room notifications back out. Every failure is reported to the
//! session that caused it and to nobody else. Notification recipients always
//! come from the room registry's snapshots.

use super::connections::SessionTable;
use crate::call::{CallService, LeaveOutcome};
use crate::engine::EngineEvent;
use crate::error::{CallError, Result};
use meshrelay_protocol::{ClientMessage, RoomId, ServerMessage, SessionId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How a session asked to leave; decides the acknowledgement it gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaveKind {
    Leave,
    Stop,
}

pub struct SignalingRouter {
    service: Arc<CallService>,
    sessions: SessionTable,
    default_room: RoomId,
}

impl SignalingRouter {
    pub fn new(service: Arc<CallService>, default_room: RoomId) -> Self {
        Self {
            service,
            sessions: SessionTable::new(),
            default_room,
        }
    }

    pub fn service(&self) -> &Arc<CallService> {
        &self.service
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.session_count().await
    }

    /// Register a new connection and its outbound channel
    pub async fn connect(&self, session_id: SessionId, sender: mpsc::UnboundedSender<String>) {
        tracing::info!("Session {} connected", session_id);
        self.sessions.add_session(session_id, sender).await;
    }

    /// Handle one inbound text frame
    pub async fn handle_text(&self, session_id: &SessionId, text: &str) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Invalid message from {}: {}", session_id, e);
                self.report(session_id, &CallError::MalformedMessage(e.to_string()))
                    .await;
                return;
            }
        };

        if let Err(e) = self.dispatch(session_id, message).await {
            tracing::warn!("Request from session {} failed: {}", session_id, e);
            self.report(session_id, &e).await;
        }
    }

    pub async fn dispatch(&self, session_id: &SessionId, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Join { room_id } => {
                let room_id = room_id
                    .filter(|room_id| !room_id.as_str().is_empty())
                    .unwrap_or_else(|| self.default_room.clone());
                self.join(session_id, room_id).await
            }
            ClientMessage::Call => {
                let sdp_offer = self.service.start_communication(session_id).await?;
                self.send(session_id, ServerMessage::StartCommunication { sdp_offer })
                    .await;
                Ok(())
            }
            ClientMessage::Offer(payload) => {
                let sdp_offer = payload.into_sdp().ok_or_else(|| {
                    CallError::MalformedMessage("offer carries no sdp".to_string())
                })?;
                let sdp = self.service.process_offer(session_id, &sdp_offer).await?;
                self.send(session_id, ServerMessage::Answer { sdp }).await;
                Ok(())
            }
            ClientMessage::ProcessOffer { sdp } => {
                let sdp_answer = self.service.process_offer(session_id, &sdp).await?;
                self.send(session_id, ServerMessage::ProcessAnswer { sdp_answer })
                    .await;
                Ok(())
            }
            ClientMessage::ProcessAnswer { sdp } => {
                self.service.process_answer(session_id, &sdp).await
            }
            ClientMessage::IceCandidate(payload) => {
                match payload.into_candidate() {
                    Some(candidate) => {
                        self.service.add_ice_candidate(session_id, &candidate).await
                    }
                    None => tracing::warn!(
                        "ICE candidate message from {} carries no candidate",
                        session_id
                    ),
                }
                Ok(())
            }
            ClientMessage::Leave => {
                self.leave(session_id, LeaveKind::Leave).await;
                Ok(())
            }
            ClientMessage::Stop => {
                self.leave(session_id, LeaveKind::Stop).await;
                Ok(())
            }
            ClientMessage::Ping => {
                self.send(session_id, ServerMessage::Pong).await;
                Ok(())
            }
            ClientMessage::Unknown => {
                tracing::warn!("Ignoring message of unknown type from {}", session_id);
                Ok(())
            }
        }
    }

    /// Same cleanup as a leave, without replying to the departed session
    pub async fn disconnect(&self, session_id: &SessionId) {
        self.sessions.remove_session(session_id).await;
        if let Some(outcome) = self.service.leave(session_id).await {
            self.notify_left(session_id, &outcome).await;
        }
        tracing::info!("Session {} disconnected", session_id);
    }

    /// Relay engine events to the sessions they belong to until the channel
    /// closes
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    EngineEvent::IceCandidate {
                        session_id,
                        candidate,
                    } => {
                        tracing::debug!("Relaying ICE candidate to session {}", session_id);
                        router
                            .sessions
                            .send_to_session(&session_id, &ServerMessage::IceCandidate { candidate })
                            .await;
                    }
                    EngineEvent::Connected { session_id } => {
                        if router.service.endpoint_connected(&session_id).await
                            && router.service.take_pending_renegotiation(&session_id).await
                        {
                            router.renegotiate(&session_id).await;
                        }
                    }
                    EngineEvent::RenegotiationNeeded { session_id } => {
                        router.renegotiate(&session_id).await;
                    }
                }
            }
            tracing::debug!("Engine event channel closed");
        })
    }

    async fn join(&self, session_id: &SessionId, room_id: RoomId) -> Result<()> {
        let outcome = self.service.join(session_id, &room_id).await?;

        self.send(
            session_id,
            ServerMessage::Joined {
                room_id: room_id.clone(),
                session_id: session_id.clone(),
            },
        )
        .await;

        if !outcome.rejoined {
            self.sessions
                .send_to_sessions(
                    &outcome.peers,
                    &ServerMessage::UserJoined {
                        session_id: session_id.clone(),
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Send the session a new offer if its relays changed after negotiation.
    /// Failures are logged, never reported to the session.
    async fn renegotiate(&self, session_id: &SessionId) {
        match self.service.renegotiate(session_id).await {
            Ok(Some(sdp_offer)) => {
                tracing::info!("Renegotiating with session {}", session_id);
                self.send(session_id, ServerMessage::StartCommunication { sdp_offer })
                    .await;
            }
            Ok(None) => {
                let state = self.service.negotiation_state(session_id).await;
                tracing::debug!(
                    "No renegotiation due for session {} in state {:?}",
                    session_id,
                    state
                );
            }
            Err(e) => tracing::warn!("Renegotiation for session {} failed: {}", session_id, e),
        }
    }

    async fn leave(&self, session_id: &SessionId, kind: LeaveKind) {
        if let Some(outcome) = self.service.leave(session_id).await {
            self.notify_left(session_id, &outcome).await;
        }

        let ack = match kind {
            LeaveKind::Leave => ServerMessage::Left {
                session_id: session_id.clone(),
            },
            LeaveKind::Stop => ServerMessage::StopCommunication {
                session_id: session_id.clone(),
            },
        };
        self.send(session_id, ack).await;
    }

    async fn notify_left(&self, session_id: &SessionId, outcome: &LeaveOutcome) {
        tracing::debug!(
            "Session {} left room {}, {} remaining",
            session_id,
            outcome.room_id,
            outcome.remaining.len()
        );
        self.sessions
            .send_to_sessions(
                &outcome.remaining,
                &ServerMessage::UserLeft {
                    session_id: session_id.clone(),
                },
            )
            .await;
    }

    async fn send(&self, session_id: &SessionId, message: ServerMessage) {
        self.sessions.send_to_session(session_id, &message).await;
    }

    async fn report(&self, session_id: &SessionId, error: &CallError) {
        self.send(
            session_id,
            ServerMessage::Error {
                message: error.to_string(),
            },
        )
        .await;
    }
}
