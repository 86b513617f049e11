#![forbid(unsafe_code)]

// Mediasoup-backed media engine
// Wraps routers, transports, producers and consumers behind the engine traits.
// Every handle owns its mediasoup entity in an Option; closing drops it,
// which is how mediasoup closes things.

pub mod config;
pub mod worker_manager;

pub use config::MediaConfig;
pub use worker_manager::WorkerManager;

use super::{
    CloseHandler, ConnectionState, ConsumerHandle, EventHandler, MediaEngine, MediaError, MediaKind,
    MediaResult, ProducerHandle, RouterHandle, TransportDirection, TransportHandle,
};
use async_trait::async_trait;
use mediasoup::data_structures::{DtlsParameters, DtlsState, IceState};
use mediasoup::prelude::*;
use mediasoup::rtp_observer::{RtpObserver, RtpObserverAddProducerOptions};
use mediasoup::rtp_parameters::MediaKind as RtpKind;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use worker_manager::WorkerLease;

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> MediaResult<T> {
    serde_json::from_value(value).map_err(|e| MediaError::InvalidParameters(format!("{what}: {e}")))
}

fn parse_producer_id(producer_id: &str) -> MediaResult<ProducerId> {
    from_json(Value::from(producer_id), "producer id")
}

fn current<T: Clone>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

fn to_rtp_kind(kind: MediaKind) -> RtpKind {
    match kind {
        MediaKind::Audio => RtpKind::Audio,
        MediaKind::Video => RtpKind::Video,
    }
}

fn from_rtp_kind(kind: RtpKind) -> MediaKind {
    match kind {
        RtpKind::Audio => MediaKind::Audio,
        RtpKind::Video => MediaKind::Video,
    }
}

/// The media engine: a worker pool handing out one router per room
pub struct MediasoupEngine {
    workers: Arc<WorkerManager>,
    config: Arc<MediaConfig>,
}

impl MediasoupEngine {
    /// Starts the worker pool
    ///
    /// # Errors
    /// Returns `MediaError::WorkerError` if the workers can't start
    pub async fn new(config: MediaConfig) -> MediaResult<Self> {
        let workers = WorkerManager::new(&config).await?;
        info!("Media engine ready with {} workers", workers.worker_count());
        Ok(Self {
            workers: Arc::new(workers),
            config: Arc::new(config),
        })
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_router(&self, room_id: &str) -> MediaResult<Arc<dyn RouterHandle>> {
        let lease = self.workers.acquire()?;

        let router = match lease
            .worker
            .create_router(self.config.router_config.to_router_options())
            .await
        {
            Ok(router) => router,
            Err(e) => {
                self.workers.release(&lease);
                return Err(MediaError::RouterError(format!("Failed to create router: {e}")));
            }
        };

        let observer = match router
            .create_audio_level_observer(self.config.audio_level.to_observer_options())
            .await
        {
            Ok(observer) => observer,
            Err(e) => {
                self.workers.release(&lease);
                return Err(MediaError::RouterError(format!(
                    "Failed to create audio level observer: {e}"
                )));
            }
        };

        info!("Created router {} for room {}", router.id(), room_id);
        Ok(Arc::new(MediasoupRouter {
            id: router.id().to_string(),
            rtp_capabilities: to_json(router.rtp_capabilities()),
            inner: Mutex::new(Some(RouterInner { router, observer })),
            lease,
            workers: self.workers.clone(),
        }))
    }
}

#[derive(Clone)]
struct RouterInner {
    router: Router,
    observer: AudioLevelObserver,
}

struct MediasoupRouter {
    id: String,
    rtp_capabilities: Value,
    inner: Mutex<Option<RouterInner>>,
    lease: WorkerLease,
    workers: Arc<WorkerManager>,
}

impl MediasoupRouter {
    fn inner(&self) -> MediaResult<RouterInner> {
        current(&self.inner).ok_or_else(|| MediaError::RouterError(format!("router {} closed", self.id)))
    }
}

#[async_trait]
impl RouterHandle for MediasoupRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Ok(inner) = self.inner() else {
            return false;
        };
        let Ok(producer_id) = parse_producer_id(producer_id) else {
            return false;
        };
        match serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) {
            Ok(caps) => inner.router.can_consume(&producer_id, &caps),
            Err(e) => {
                debug!("Unreadable RTP capabilities: {}", e);
                false
            }
        }
    }

    async fn create_webrtc_transport(
        &self,
        direction: TransportDirection,
    ) -> MediaResult<Arc<dyn TransportHandle>> {
        let inner = self.inner()?;
        let options = WebRtcTransportOptions::new_with_server(self.lease.webrtc_server.clone());
        let transport = inner
            .router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create {direction} transport: {e}")))?;

        let id = transport.id().to_string();
        let params = json!({
            "id": id,
            "iceParameters": to_json(transport.ice_parameters()),
            "iceCandidates": to_json(transport.ice_candidates()),
            "dtlsParameters": to_json(&transport.dtls_parameters()),
        });

        transport
            .on_close({
                let id = id.clone();
                Box::new(move || debug!("Transport {} ({}) closed", id, direction))
            })
            .detach();

        Ok(Arc::new(MediasoupTransport {
            id,
            params,
            transport: Mutex::new(Some(transport)),
        }))
    }

    async fn observe_audio_level(&self, producer_id: &str) -> MediaResult<()> {
        let inner = self.inner()?;
        let producer_id = parse_producer_id(producer_id)?;
        inner
            .observer
            .add_producer(RtpObserverAddProducerOptions::new(producer_id))
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to observe audio level: {e}")))
    }

    async fn unobserve_audio_level(&self, producer_id: &str) -> MediaResult<()> {
        let inner = self.inner()?;
        let producer_id = parse_producer_id(producer_id)?;
        inner
            .observer
            .remove_producer(producer_id)
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to unobserve audio level: {e}")))
    }

    fn on_volumes(&self, handler: EventHandler<Vec<String>>) {
        let Ok(inner) = self.inner() else {
            return;
        };
        inner
            .observer
            .on_volumes(move |volumes| {
                let mut loudest: Vec<_> = volumes.iter().map(|v| (v.volume, v.producer.id())).collect();
                loudest.sort_by(|a, b| b.0.cmp(&a.0));
                handler(loudest.into_iter().map(|(_, id)| id.to_string()).collect());
            })
            .detach();
    }

    fn on_silence(&self, handler: EventHandler<()>) {
        let Ok(inner) = self.inner() else {
            return;
        };
        inner.observer.on_silence(move || handler(())).detach();
    }

    fn close(&self) {
        if take(&self.inner).is_some() {
            self.workers.release(&self.lease);
            debug!("Router {} closed", self.id);
        }
    }
}

struct MediasoupTransport {
    id: String,
    params: Value,
    transport: Mutex<Option<WebRtcTransport>>,
}

impl MediasoupTransport {
    fn transport(&self) -> MediaResult<WebRtcTransport> {
        current(&self.transport)
            .ok_or_else(|| MediaError::TransportError(format!("transport {} closed", self.id)))
    }
}

#[async_trait]
impl TransportHandle for MediasoupTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn connection_params(&self) -> Value {
        self.params.clone()
    }

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()> {
        let transport = self.transport()?;
        let dtls_parameters: DtlsParameters = from_json(dtls_parameters, "dtlsParameters")?;
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect transport {}: {e}", self.id)))
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<Arc<dyn ProducerHandle>> {
        let transport = self.transport()?;
        let rtp_parameters: RtpParameters = from_json(rtp_parameters, "rtpParameters")?;
        let producer = transport
            .produce(ProducerOptions::new(to_rtp_kind(kind), rtp_parameters))
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to produce {kind}: {e}")))?;

        Ok(Arc::new(MediasoupProducer {
            id: producer.id().to_string(),
            kind,
            producer: Mutex::new(Some(producer)),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Arc<dyn ConsumerHandle>> {
        let transport = self.transport()?;
        let producer_id = parse_producer_id(producer_id)?;
        let rtp_capabilities: RtpCapabilities = from_json(rtp_capabilities, "rtpCapabilities")?;

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = paused;
        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to consume {producer_id}: {e}")))?;

        Ok(Arc::new(MediasoupConsumer {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: from_rtp_kind(consumer.kind()),
            rtp_parameters: to_json(consumer.rtp_parameters()),
            consumer: Mutex::new(Some(consumer)),
        }))
    }

    fn on_state_change(&self, handler: EventHandler<ConnectionState>) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let handler: Arc<EventHandler<ConnectionState>> = Arc::new(handler);

        transport
            .on_ice_state_change({
                let handler = handler.clone();
                move |state| {
                    handler(match state {
                        IceState::Connected | IceState::Completed => ConnectionState::Connected,
                        IceState::Disconnected => ConnectionState::Disconnected,
                        _ => ConnectionState::New,
                    })
                }
            })
            .detach();

        transport
            .on_dtls_state_change(move |state| {
                handler(match state {
                    DtlsState::Connecting => ConnectionState::Connecting,
                    DtlsState::Connected => ConnectionState::Connected,
                    DtlsState::Failed => ConnectionState::Failed,
                    DtlsState::Closed => ConnectionState::Closed,
                    _ => ConnectionState::New,
                })
            })
            .detach();
    }

    fn close(&self) {
        if take(&self.transport).is_some() {
            debug!("Closing transport {}", self.id);
        }
    }
}

struct MediasoupProducer {
    id: String,
    kind: MediaKind,
    producer: Mutex<Option<Producer>>,
}

impl MediasoupProducer {
    fn producer(&self) -> MediaResult<Producer> {
        current(&self.producer).ok_or_else(|| MediaError::ProducerError(format!("producer {} closed", self.id)))
    }
}

#[async_trait]
impl ProducerHandle for MediasoupProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn pause(&self) -> MediaResult<()> {
        self.producer()?
            .pause()
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to pause producer {}: {e}", self.id)))
    }

    async fn resume(&self) -> MediaResult<()> {
        self.producer()?
            .resume()
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to resume producer {}: {e}", self.id)))
    }

    fn on_score(&self, handler: EventHandler<u8>) {
        let Ok(producer) = self.producer() else {
            return;
        };
        producer
            .on_score(move |scores| {
                if let Some(score) = scores.iter().map(|s| s.score).max() {
                    handler(score);
                }
            })
            .detach();
    }

    fn on_close(&self, handler: CloseHandler) {
        match self.producer() {
            Ok(producer) => producer.on_close(move || handler()).detach(),
            Err(_) => handler(),
        }
    }

    fn close(&self) {
        if take(&self.producer).is_some() {
            debug!("Closing producer {}", self.id);
        }
    }
}

struct MediasoupConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    consumer: Mutex<Option<Consumer>>,
}

impl MediasoupConsumer {
    fn consumer(&self) -> MediaResult<Consumer> {
        current(&self.consumer).ok_or_else(|| MediaError::ConsumerError(format!("consumer {} closed", self.id)))
    }
}

#[async_trait]
impl ConsumerHandle for MediasoupConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    async fn pause(&self) -> MediaResult<()> {
        self.consumer()?
            .pause()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to pause consumer {}: {e}", self.id)))
    }

    async fn resume(&self) -> MediaResult<()> {
        self.consumer()?
            .resume()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to resume consumer {}: {e}", self.id)))
    }

    async fn request_key_frame(&self) -> MediaResult<()> {
        self.consumer()?
            .request_key_frame()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Key frame request failed for {}: {e}", self.id)))
    }

    fn close(&self) {
        if take(&self.consumer).is_some() {
            debug!("Closing consumer {}", self.id);
        }
    }
}
