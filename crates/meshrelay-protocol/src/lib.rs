//! Signaling protocol shared by the meshrelay server and its clients.
//!
//! Every frame is a JSON object with a `type` tag. Several message types accept
//! more than one payload shape because browsers in the wild send both.

mod messages;
mod types;

pub use messages::{ClientMessage, ServerMessage};
pub use types::{IceCandidateData, IceCandidatePayload, OfferPayload, RoomId, SdpData, SessionId};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> ClientMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn join_without_room_id_parses() {
        match parse(json!({"type": "join"})) {
            ClientMessage::Join { room_id } => assert!(room_id.is_none()),
            other => panic!("unexpected {:?}", other),
        }

        match parse(json!({"type": "join", "roomId": "r1"})) {
            ClientMessage::Join { room_id } => assert_eq!(room_id, Some(RoomId::from("r1"))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn offer_accepts_nested_and_flat_sdp() {
        let nested = parse(json!({"type": "offer", "data": {"type": "offer", "sdp": "v=0 nested"}}));
        let flat = parse(json!({"type": "offer", "sdp": "v=0 flat"}));

        match (nested, flat) {
            (ClientMessage::Offer(a), ClientMessage::Offer(b)) => {
                assert_eq!(a.into_sdp().as_deref(), Some("v=0 nested"));
                assert_eq!(b.into_sdp().as_deref(), Some("v=0 flat"));
            }
            other => panic!("unexpected {:?}", other),
        }

        match parse(json!({"type": "offer"})) {
            ClientMessage::Offer(payload) => assert!(payload.into_sdp().is_none()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn process_answer_accepts_sdp_answer_key() {
        match parse(json!({"type": "processAnswer", "sdpAnswer": "v=0"})) {
            ClientMessage::ProcessAnswer { sdp } => assert_eq!(sdp, "v=0"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ice_candidate_shapes_resolve_to_same_candidate() {
        let expected = IceCandidateData {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let object = json!({
            "candidate": expected.candidate,
            "sdpMid": "0",
            "sdpMLineIndex": 0
        });

        let shapes = [
            json!({"type": "ice-candidate", "data": object.clone()}),
            json!({"type": "onIceCandidate", "candidate": object.clone()}),
            json!({
                "type": "iceCandidate",
                "candidate": expected.candidate,
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }),
        ];

        for shape in shapes {
            match parse(shape) {
                ClientMessage::IceCandidate(payload) => {
                    assert_eq!(payload.into_candidate(), Some(expected.clone()))
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn broken_ice_candidates_parse_but_yield_nothing() {
        let shapes = [
            json!({"type": "ice-candidate", "data": {"sdpMid": "0", "sdpMLineIndex": 0}}),
            json!({"type": "ice-candidate", "data": {"candidate": "candidate:1", "sdpMLineIndex": "zero"}}),
            json!({"type": "iceCandidate", "data": "candidate:1 1 udp"}),
            json!({"type": "onIceCandidate", "candidate": 42}),
            json!({"type": "onIceCandidate"}),
        ];

        for shape in shapes {
            match parse(shape.clone()) {
                ClientMessage::IceCandidate(payload) => {
                    assert_eq!(payload.into_candidate(), None, "{}", shape)
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn candidate_line_ignores_mistyped_siblings() {
        let payload = match parse(json!({
            "type": "iceCandidate",
            "candidate": "candidate:1",
            "sdpMid": 0,
            "sdpMLineIndex": "0"
        })) {
            ClientMessage::IceCandidate(payload) => payload,
            other => panic!("unexpected {:?}", other),
        };

        assert_eq!(
            payload.into_candidate(),
            Some(IceCandidateData {
                candidate: "candidate:1".to_string(),
                sdp_mid: None,
                sdp_mline_index: None,
            })
        );
    }

    #[test]
    fn unknown_type_maps_to_unknown() {
        assert!(matches!(
            parse(json!({"type": "renegotiate", "foo": 1})),
            ClientMessage::Unknown
        ));
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let result: Result<ClientMessage, _> =
            serde_json::from_value(json!({"type": "processOffer"}));
        assert!(result.is_err());

        let result: Result<ClientMessage, _> = serde_json::from_value(json!({"roomId": "r1"}));
        assert!(result.is_err());
    }

    #[test]
    fn server_messages_use_wire_names() {
        let joined = serde_json::to_value(ServerMessage::Joined {
            room_id: RoomId::from("r1"),
            session_id: SessionId::from("s1"),
        })
        .unwrap();
        assert_eq!(joined, json!({"type": "joined", "roomId": "r1", "sessionId": "s1"}));

        let left = serde_json::to_value(ServerMessage::UserLeft {
            session_id: SessionId::from("s2"),
        })
        .unwrap();
        assert_eq!(left, json!({"type": "user-left", "sessionId": "s2"}));

        let offer = serde_json::to_value(ServerMessage::StartCommunication {
            sdp_offer: "v=0".to_string(),
        })
        .unwrap();
        assert_eq!(offer, json!({"type": "startCommunication", "sdpOffer": "v=0"}));

        let candidate = serde_json::to_value(ServerMessage::IceCandidate {
            candidate: IceCandidateData {
                candidate: "candidate:1".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        })
        .unwrap();
        assert_eq!(
            candidate,
            json!({
                "type": "iceCandidate",
                "candidate": {"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}
            })
        );
    }
}
