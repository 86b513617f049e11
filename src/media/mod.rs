#![forbid(unsafe_code)]

// Media module - the opaque media engine boundary
// The coordinator only talks to routers, transports, producers and consumers
// through these traits. Parameters it does not interpret (RTP capabilities,
// RTP parameters, DTLS parameters, ICE candidates) cross as raw JSON.

pub mod types;

#[cfg(feature = "mediasoup")]
pub mod mediasoup;

#[cfg(test)]
pub(crate) mod fake;

pub use types::{
    CloseHandler, ConnectionState, EventHandler, MediaError, MediaKind, MediaResult, MediaSource,
    TransportDirection,
};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Entry point into the media engine: one router per room.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Creates a router (and its audio level observer) for a room
    async fn create_router(&self, room_id: &str) -> MediaResult<Arc<dyn RouterHandle>>;
}

/// A room's router.
///
/// `on_volumes` receives the ids of the currently loud audio producers,
/// loudest first. `on_silence` fires when nobody is speaking.
#[async_trait]
pub trait RouterHandle: Send + Sync {
    fn id(&self) -> String;

    /// Codecs and header extensions the router accepts
    fn rtp_capabilities(&self) -> Value;

    /// Whether a peer with `rtp_capabilities` can receive `producer_id`
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(
        &self,
        direction: TransportDirection,
    ) -> MediaResult<Arc<dyn TransportHandle>>;

    /// Adds an audio producer to the router's audio level observer
    async fn observe_audio_level(&self, producer_id: &str) -> MediaResult<()>;

    /// Removes an audio producer from the audio level observer
    async fn unobserve_audio_level(&self, producer_id: &str) -> MediaResult<()>;

    fn on_volumes(&self, handler: EventHandler<Vec<String>>);

    fn on_silence(&self, handler: EventHandler<()>);

    /// Closes the router. Calling it twice is a no-op.
    fn close(&self);
}

#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn id(&self) -> String;

    /// ICE parameters, ICE candidates and DTLS parameters for the client
    fn connection_params(&self) -> Value;

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Arc<dyn ProducerHandle>>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Arc<dyn ConsumerHandle>>;

    fn on_state_change(&self, handler: EventHandler<ConnectionState>);

    /// Closes the transport and everything built on it. Idempotent.
    fn close(&self);
}

#[async_trait]
pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    async fn pause(&self) -> MediaResult<()>;

    async fn resume(&self) -> MediaResult<()>;

    /// Receives the producer's current score (0-10)
    fn on_score(&self, handler: EventHandler<u8>);

    /// Fires once when the producer closes, whoever closed it
    fn on_close(&self, handler: CloseHandler);

    /// Idempotent
    fn close(&self);
}

#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> String;

    fn producer_id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> Value;

    async fn pause(&self) -> MediaResult<()>;

    async fn resume(&self) -> MediaResult<()>;

    async fn request_key_frame(&self) -> MediaResult<()>;

    /// Idempotent
    fn close(&self);
}
