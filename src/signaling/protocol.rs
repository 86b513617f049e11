#![forbid(unsafe_code)]

// Signaling protocol - Frames and payloads for WebSocket communication

use crate::media::{MediaKind, MediaSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Client-to-server request frame.
///
/// `data` is decoded per `event` so that a missing field surfaces as a
/// validation error in the reply instead of an unparseable frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub id: Option<u64>,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Reply to a request: `{ id, ok, data?, error?: { message } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

impl Reply {
    pub fn ok(id: Option<u64>, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                message: message.into(),
            }),
        }
    }
}

// --- Request payloads ---

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    pub room_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRequest {
    pub room_id: String,
    pub peer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePeerRequest {
    pub room_id: String,
    pub name: String,
    #[serde(default)]
    pub mic_on: bool,
    #[serde(default)]
    pub cam_on: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub room_id: String,
    pub peer_id: String,
    #[serde(default)]
    pub rtp_capabilities: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub room_id: String,
    pub peer_id: String,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceAppData {
    pub source: MediaSource,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub room_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: ProduceAppData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConsumerRequest {
    pub room_id: String,
    pub peer_id: String,
    #[serde(default)]
    pub producer_id: Option<String>,
    #[serde(default)]
    pub exporter_id: Option<String>,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerBatchRequest {
    pub room_id: String,
    pub peer_id: String,
    pub consumer_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleMicRequest {
    pub room_id: String,
    pub peer_id: String,
    #[serde(default)]
    pub mic_on: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerControlRequest {
    pub room_id: String,
    pub peer_id: String,
    pub source: MediaSource,
}

// --- Response payloads ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// A peer as seen by itself
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub room_id: String,
    pub socket_id: String,
    pub is_joined: bool,
    pub rtp_capabilities: Option<Value>,
    pub cam_on: bool,
    pub mic_on: bool,
}

/// A peer as seen by the other members of its room
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePeer {
    pub id: String,
    pub room_id: String,
    pub name: String,
    pub is_joined: bool,
    pub cam_on: bool,
    pub mic_on: bool,
    pub network_quality: BTreeMap<MediaSource, u8>,
    pub producers_data: Vec<ProducerData>,
    pub status: PeerStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerData {
    pub producer_id: String,
    pub source: MediaSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub peer: PeerInfo,
    pub remote_peers: Vec<RemotePeer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreated {
    pub transport_params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerCreated {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerCreated {
    pub id: String,
    pub rtp_parameters: Value,
    pub kind: MediaKind,
    pub producer_id: String,
}

// --- Server push events ---

/// Server-to-client push notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "peer:ready")]
    PeerReady { peer: RemotePeer },

    #[serde(rename = "peer:closed", rename_all = "camelCase")]
    PeerClosed { peer_id: String },

    #[serde(rename = "peer:camOn", rename_all = "camelCase")]
    CamOn { peer_id: String, producer_id: String },

    #[serde(rename = "peer:camOff", rename_all = "camelCase")]
    CamOff { peer_id: String, producer_id: String },

    #[serde(rename = "peer:screenOn", rename_all = "camelCase")]
    ScreenOn { peer_id: String, producer_id: String },

    #[serde(rename = "peer:screenOff", rename_all = "camelCase")]
    ScreenOff { peer_id: String, producer_id: String },

    #[serde(rename = "peer:toggleMic", rename_all = "camelCase")]
    ToggleMic {
        peer_id: String,
        mic_on: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        producer_id: Option<String>,
    },

    #[serde(rename = "peer:updateNetworkQuality", rename_all = "camelCase")]
    UpdateNetworkQuality {
        peer_id: String,
        network_quality: BTreeMap<MediaSource, u8>,
    },

    #[serde(rename = "room:activeSpeaker", rename_all = "camelCase")]
    ActiveSpeaker { peer_ids: Vec<String> },

    #[serde(rename = "room:updateCount")]
    UpdateCount { count: usize },
}

impl ServerEvent {
    /// Wire name of the event, used in logs and tests
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::PeerReady { .. } => "peer:ready",
            ServerEvent::PeerClosed { .. } => "peer:closed",
            ServerEvent::CamOn { .. } => "peer:camOn",
            ServerEvent::CamOff { .. } => "peer:camOff",
            ServerEvent::ScreenOn { .. } => "peer:screenOn",
            ServerEvent::ScreenOff { .. } => "peer:screenOff",
            ServerEvent::ToggleMic { .. } => "peer:toggleMic",
            ServerEvent::UpdateNetworkQuality { .. } => "peer:updateNetworkQuality",
            ServerEvent::ActiveSpeaker { .. } => "room:activeSpeaker",
            ServerEvent::UpdateCount { .. } => "room:updateCount",
        }
    }

    /// "On" announcement for a freshly opened or resumed producer
    pub fn source_on(source: MediaSource, peer_id: &str, producer_id: &str) -> Self {
        match source {
            MediaSource::Audio => ServerEvent::ToggleMic {
                peer_id: peer_id.to_string(),
                mic_on: true,
                producer_id: Some(producer_id.to_string()),
            },
            MediaSource::Video => ServerEvent::CamOn {
                peer_id: peer_id.to_string(),
                producer_id: producer_id.to_string(),
            },
            MediaSource::Screen => ServerEvent::ScreenOn {
                peer_id: peer_id.to_string(),
                producer_id: producer_id.to_string(),
            },
        }
    }

    /// "Off" announcement for a closed producer
    pub fn source_off(source: MediaSource, peer_id: &str, producer_id: &str) -> Self {
        match source {
            MediaSource::Audio => ServerEvent::ToggleMic {
                peer_id: peer_id.to_string(),
                mic_on: false,
                producer_id: None,
            },
            MediaSource::Video => ServerEvent::CamOff {
                peer_id: peer_id.to_string(),
                producer_id: producer_id.to_string(),
            },
            MediaSource::Screen => ServerEvent::ScreenOff {
                peer_id: peer_id.to_string(),
                producer_id: producer_id.to_string(),
            },
        }
    }
}
