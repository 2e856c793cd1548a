use serde::{Deserialize, Serialize};

use crate::types::{IceCandidateData, IceCandidatePayload, OfferPayload, RoomId, SessionId};

/// Messages sent from client to server via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Join a room, creating it if needed
    #[serde(rename = "join")]
    Join {
        #[serde(default, rename = "roomId")]
        room_id: Option<RoomId>,
    },

    /// Ask the server to generate an SDP offer (server-offers flow)
    #[serde(rename = "call")]
    Call,

    /// SDP offer from the client, answered with `answer`
    #[serde(rename = "offer")]
    Offer(OfferPayload),

    /// SDP offer from the client, answered with `processAnswer`
    #[serde(rename = "processOffer")]
    ProcessOffer {
        #[serde(alias = "sdpOffer")]
        sdp: String,
    },

    /// SDP answer to a server-generated offer
    #[serde(rename = "processAnswer")]
    ProcessAnswer {
        #[serde(alias = "sdpAnswer")]
        sdp: String,
    },

    /// Remote ICE candidate discovered by the client
    #[serde(rename = "ice-candidate", alias = "iceCandidate", alias = "onIceCandidate")]
    IceCandidate(IceCandidatePayload),

    /// Leave the current room
    #[serde(rename = "leave")]
    Leave,

    /// Stop the call; same cleanup as `leave`
    #[serde(rename = "stop")]
    Stop,

    /// Ping to keep connection alive
    #[serde(rename = "ping")]
    Ping,

    /// Any message type this server does not know
    #[serde(other)]
    Unknown,
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Room join succeeded
    #[serde(rename = "joined", rename_all = "camelCase")]
    Joined { room_id: RoomId, session_id: SessionId },

    /// SDP answer to an `offer`
    #[serde(rename = "answer")]
    Answer { sdp: String },

    /// SDP answer to a `processOffer`
    #[serde(rename = "processAnswer", rename_all = "camelCase")]
    ProcessAnswer { sdp_answer: String },

    /// Server-generated SDP offer in reply to `call`
    #[serde(rename = "startCommunication", rename_all = "camelCase")]
    StartCommunication { sdp_offer: String },

    /// ICE candidate discovered by the media engine
    #[serde(rename = "iceCandidate")]
    IceCandidate { candidate: IceCandidateData },

    /// Confirms a `leave`
    #[serde(rename = "left", rename_all = "camelCase")]
    Left { session_id: SessionId },

    /// Confirms a `stop`
    #[serde(rename = "stopCommunication", rename_all = "camelCase")]
    StopCommunication { session_id: SessionId },

    /// Another session joined the room
    #[serde(rename = "user-joined", rename_all = "camelCase")]
    UserJoined { session_id: SessionId },

    /// Another session left the room
    #[serde(rename = "user-left", rename_all = "camelCase")]
    UserLeft { session_id: SessionId },

    /// Pong response to ping
    #[serde(rename = "pong")]
    Pong,

    /// Error message
    #[serde(rename = "error")]
    Error { message: String },
}
