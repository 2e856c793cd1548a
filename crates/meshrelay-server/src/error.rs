use crate::call::NegotiationState;
use crate::engine::EngineError;
use meshrelay_protocol::{RoomId, SessionId};
use thiserror::Error;

/// Failure of one session's signaling request.
///
/// Every variant is reported back to the originating session only; nothing
/// here is fatal to the process or to other sessions.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Media engine unavailable: {0}")]
    EngineUnavailable(#[source] EngineError),

    #[error("Media engine error for session {session_id}: {source}")]
    Engine {
        session_id: SessionId,
        #[source]
        source: EngineError,
    },

    #[error("No endpoint for session {0}")]
    EndpointNotFound(SessionId),

    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Session {0} has not joined a room")]
    NotInRoom(SessionId),

    #[error("Session {session_id} is already in room {room_id}")]
    AlreadyInRoom {
        session_id: SessionId,
        room_id: RoomId,
    },

    #[error("Cannot {operation} for session {session_id} in state {state}")]
    InvalidNegotiationState {
        session_id: SessionId,
        state: NegotiationState,
        operation: &'static str,
    },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),
}

impl CallError {
    pub fn engine(session_id: &SessionId, source: EngineError) -> Self {
        CallError::Engine {
            session_id: session_id.clone(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
