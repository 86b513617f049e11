#![forbid(unsafe_code)]

// Common types and error handling for the media engine boundary

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure reported by the media engine collaborator
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Router error: {0}")]
    RouterError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Producer error: {0}")]
    ProducerError(String),

    #[error("Consumer error: {0}")]
    ConsumerError(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Kind of an RTP stream as seen by the media engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Logical source of a producer. A peer owns at most one producer per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Audio,
    Video,
    Screen,
}

impl MediaSource {
    pub const ALL: [MediaSource; 3] = [MediaSource::Audio, MediaSource::Video, MediaSource::Screen];

    /// The RTP kind a producer for this source must carry
    pub fn kind(self) -> MediaKind {
        match self {
            MediaSource::Audio => MediaKind::Audio,
            MediaSource::Video | MediaSource::Screen => MediaKind::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaSource::Audio => "audio",
            MediaSource::Video => "video",
            MediaSource::Screen => "screen",
        }
    }
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a WebRTC transport, from the peer's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => f.write_str("send"),
            TransportDirection::Recv => f.write_str("recv"),
        }
    }
}

/// ICE/DTLS connectivity reported by the engine. Only logged by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Synchronous callback registered on an engine entity
pub type EventHandler<T> = Box<dyn Fn(T) + Send + Sync + 'static>;

/// Synchronous one-shot callback for close notifications
pub type CloseHandler = Box<dyn FnOnce() + Send + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_and_video_sources_share_the_video_kind() {
        assert_eq!(MediaSource::Audio.kind(), MediaKind::Audio);
        assert_eq!(MediaSource::Video.kind(), MediaKind::Video);
        assert_eq!(MediaSource::Screen.kind(), MediaKind::Video);
    }

    #[test]
    fn sources_serialize_lowercase() {
        let json = serde_json::to_string(&MediaSource::Screen).unwrap();
        assert_eq!(json, "\"screen\"");
        let parsed: TransportDirection = serde_json::from_str("\"recv\"").unwrap();
        assert_eq!(parsed, TransportDirection::Recv);
    }
}
