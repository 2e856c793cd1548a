use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifies one connected signaling client
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Name of a room; rooms are created on first join
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// ICE candidate as exchanged with browsers (`RTCIceCandidateInit` shape)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateData {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Session description nested under `data`, e.g. `{"type":"offer","sdp":"..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpData {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    pub sdp: String,
}

/// Payload of an `offer` message.
///
/// Browsers built around `RTCSessionDescription` send `{"data": {"sdp": ...}}`,
/// simpler clients put `sdp` at the top level. Both are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SdpData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
}

impl OfferPayload {
    pub fn into_sdp(self) -> Option<String> {
        self.data.map(|d| d.sdp).or(self.sdp)
    }
}

/// Payload of an inbound ICE candidate message in any of its accepted shapes.
///
/// Fields stay as raw JSON so a mangled candidate never fails the whole frame;
/// [`IceCandidatePayload::into_candidate`] picks out whatever is usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Either the whole candidate object or just the candidate line with
    /// `sdpMid`/`sdpMLineIndex` as siblings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
    #[serde(default, rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<Value>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<Value>,
}

impl IceCandidatePayload {
    /// `None` when no shape yields a candidate line
    pub fn into_candidate(self) -> Option<IceCandidateData> {
        if let Some(data) = self.data {
            return serde_json::from_value(data).ok();
        }
        match self.candidate? {
            Value::String(candidate) => Some(IceCandidateData {
                candidate,
                sdp_mid: self.sdp_mid.and_then(|mid| mid.as_str().map(str::to_string)),
                sdp_mline_index: self
                    .sdp_mline_index
                    .and_then(|index| index.as_u64())
                    .and_then(|index| u16::try_from(index).ok()),
            }),
            object @ Value::Object(_) => serde_json::from_value(object).ok(),
            _ => None,
        }
    }
}
