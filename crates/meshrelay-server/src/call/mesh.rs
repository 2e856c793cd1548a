//! Full-mesh relay wiring
//!
//! Every participant relays its media to every other participant of the room
//! through the engine, so a room of N members carries N×(N−1) directed links.

use super::endpoint::EndpointCoordinator;
use crate::engine::{EndpointHandle, MediaEngine};
use meshrelay_protocol::{RoomId, SessionId};
use std::sync::Arc;

/// Outcome of wiring one newcomer into a room
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MeshReport {
    /// Directed links created, as (source, sink)
    pub linked: Vec<(SessionId, SessionId)>,
    /// Directed links the engine refused
    pub failed: Vec<(SessionId, SessionId)>,
    /// Peers with no live endpoint at attach time
    pub skipped: Vec<SessionId>,
}

impl MeshReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

pub struct MeshConnector {
    engine: Arc<dyn MediaEngine>,
    endpoints: Arc<EndpointCoordinator>,
}

impl MeshConnector {
    pub fn new(engine: Arc<dyn MediaEngine>, endpoints: Arc<EndpointCoordinator>) -> Self {
        Self { engine, endpoints }
    }

    /// Link `new_session` with each of `peers`, in both directions.
    ///
    /// Directions already recorded are left alone, so two joiners that both
    /// see each other link once. Peers are handled independently: a refused
    /// link is logged and reported, never propagated.
    pub async fn attach_new_participant(
        &self,
        room_id: &RoomId,
        new_session: &SessionId,
        peers: &[SessionId],
    ) -> MeshReport {
        let mut report = MeshReport::default();

        let Some(new_handle) = self.endpoints.live_handle(new_session).await else {
            tracing::warn!(
                "Session {} has no live endpoint, not wiring it into room {}",
                new_session,
                room_id
            );
            report.skipped.extend(peers.iter().cloned());
            return report;
        };

        for peer in peers {
            if peer == new_session {
                continue;
            }

            let Some(peer_handle) = self.endpoints.live_handle(peer).await else {
                tracing::debug!(
                    "Skipping peer {} in room {}: endpoint gone",
                    peer,
                    room_id
                );
                report.skipped.push(peer.clone());
                continue;
            };

            if !self.endpoints.is_linked(peer, new_session).await {
                self.link(peer, &peer_handle, new_session, &new_handle, &mut report)
                    .await;
            }
            if !self.endpoints.is_linked(new_session, peer).await {
                self.link(new_session, &new_handle, peer, &peer_handle, &mut report)
                    .await;
            }
        }

        tracing::info!(
            "Wired session {} into room {}: {} links, {} failed, {} skipped",
            new_session,
            room_id,
            report.linked.len(),
            report.failed.len(),
            report.skipped.len()
        );
        report
    }

    /// Unwire `leaving` from the room's relay graph.
    ///
    /// The engine is only asked to tear links down when it requires it; the
    /// recorded peer sets are always cleared.
    pub async fn detach_participant(&self, room_id: &RoomId, leaving: &SessionId) -> usize {
        let outgoing = self.endpoints.peers_of(leaving).await;
        let incoming = self.endpoints.sources_of(leaving).await;
        let explicit = self.engine.requires_explicit_unlink();
        let mut unlinked = 0;

        let leaving_handle = self.endpoints.handle_of(leaving).await;

        for sink in &outgoing {
            if explicit {
                if let (Some(source), Some(sink_handle)) =
                    (&leaving_handle, self.endpoints.handle_of(sink).await)
                {
                    if self.unlink(source, &sink_handle).await {
                        unlinked += 1;
                    }
                }
            }
            self.endpoints.forget_link(leaving, sink).await;
        }

        for source in &incoming {
            if explicit {
                if let (Some(source_handle), Some(sink)) =
                    (self.endpoints.handle_of(source).await, &leaving_handle)
                {
                    if self.unlink(&source_handle, sink).await {
                        unlinked += 1;
                    }
                }
            }
            self.endpoints.forget_link(source, leaving).await;
        }

        tracing::debug!(
            "Detached session {} from room {} ({} outgoing, {} incoming, {} unlinked)",
            leaving,
            room_id,
            outgoing.len(),
            incoming.len(),
            unlinked
        );
        unlinked
    }

    async fn link(
        &self,
        source: &SessionId,
        source_handle: &EndpointHandle,
        sink: &SessionId,
        sink_handle: &EndpointHandle,
        report: &mut MeshReport,
    ) {
        match self.engine.connect(source_handle, sink_handle).await {
            Ok(()) => {
                self.endpoints.record_link(source, sink).await;
                report.linked.push((source.clone(), sink.clone()));
            }
            Err(e) => {
                tracing::warn!("Failed to link {} -> {}: {}", source, sink, e);
                report.failed.push((source.clone(), sink.clone()));
            }
        }
    }

    async fn unlink(&self, source: &EndpointHandle, sink: &EndpointHandle) -> bool {
        match self.engine.disconnect(source, sink).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to unlink {} -> {}: {}", source, sink, e);
                false
            }
        }
    }
}
