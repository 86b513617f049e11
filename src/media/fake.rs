#![forbid(unsafe_code)]

// In-process media engine for tests: no RTP, just bookkeeping and hooks

use super::{
    CloseHandler, ConnectionState, ConsumerHandle, EventHandler, MediaEngine, MediaError, MediaKind,
    MediaResult, ProducerHandle, RouterHandle, TransportDirection, TransportHandle,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Default)]
struct State {
    next_id: AtomicU64,
    routers: Mutex<Vec<Arc<FakeRouter>>>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    producers: Mutex<HashMap<String, Arc<FakeProducer>>>,
    consumers: Mutex<HashMap<String, Arc<FakeConsumer>>>,
    observed: Mutex<Vec<String>>,
    fail_connect: AtomicBool,
    produce_gate: Mutex<Option<ProduceGate>>,
}

impl State {
    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Blocks the next `produce` call until released
#[derive(Clone, Default)]
pub(crate) struct ProduceGate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl ProduceGate {
    pub(crate) async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub(crate) fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeEngine {
    state: Arc<State>,
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn routers_created(&self) -> usize {
        self.state.routers.lock().unwrap().len()
    }

    pub(crate) fn open_routers(&self) -> usize {
        let routers = self.state.routers.lock().unwrap();
        routers.iter().filter(|r| !r.closed.load(Ordering::SeqCst)).count()
    }

    pub(crate) fn open_transports(&self) -> usize {
        let transports = self.state.transports.lock().unwrap();
        transports.iter().filter(|t| !t.closed.load(Ordering::SeqCst)).count()
    }

    pub(crate) fn open_producers(&self) -> usize {
        let producers = self.state.producers.lock().unwrap();
        producers.values().filter(|p| !p.closed.load(Ordering::SeqCst)).count()
    }

    pub(crate) fn open_consumers(&self) -> usize {
        let consumers = self.state.consumers.lock().unwrap();
        consumers.values().filter(|c| !c.closed.load(Ordering::SeqCst)).count()
    }

    fn producer(&self, id: &str) -> Arc<FakeProducer> {
        self.state.producers.lock().unwrap()[id].clone()
    }

    fn consumer(&self, id: &str) -> Arc<FakeConsumer> {
        self.state.consumers.lock().unwrap()[id].clone()
    }

    pub(crate) fn producer_close_count(&self, id: &str) -> usize {
        self.producer(id).close_count.load(Ordering::SeqCst)
    }

    pub(crate) fn producer_paused(&self, id: &str) -> bool {
        self.producer(id).paused.load(Ordering::SeqCst)
    }

    pub(crate) fn consumer_paused(&self, id: &str) -> bool {
        self.consumer(id).paused.load(Ordering::SeqCst)
    }

    pub(crate) fn key_frame_requests(&self, id: &str) -> usize {
        self.consumer(id).key_frames.load(Ordering::SeqCst)
    }

    pub(crate) fn observed_audio(&self) -> Vec<String> {
        self.state.observed.lock().unwrap().clone()
    }

    pub(crate) fn emit_score(&self, producer_id: &str, score: u8) {
        let producer = self.producer(producer_id);
        let handler = producer.score_handler.lock().unwrap();
        if let Some(handler) = handler.as_ref() {
            handler(score);
        }
    }

    pub(crate) fn emit_volumes(&self, producer_ids: &[String]) {
        let routers = self.state.routers.lock().unwrap().clone();
        for router in routers {
            let handler = router.volumes_handler.lock().unwrap();
            if let Some(handler) = handler.as_ref() {
                handler(producer_ids.to_vec());
            }
        }
    }

    pub(crate) fn emit_silence(&self) {
        let routers = self.state.routers.lock().unwrap().clone();
        for router in routers {
            let handler = router.silence_handler.lock().unwrap();
            if let Some(handler) = handler.as_ref() {
                handler(());
            }
        }
    }

    /// Closes a producer as if the engine had done it on its own
    pub(crate) fn close_producer_remotely(&self, producer_id: &str) {
        self.producer(producer_id).close();
    }

    pub(crate) fn fail_next_connect(&self) {
        self.state.fail_connect.store(true, Ordering::SeqCst);
    }

    pub(crate) fn hold_produce(&self) -> ProduceGate {
        let gate = ProduceGate::default();
        *self.state.produce_gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_router(&self, _room_id: &str) -> MediaResult<Arc<dyn RouterHandle>> {
        let router = Arc::new(FakeRouter {
            id: self.state.next_id("router"),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
            volumes_handler: Mutex::new(None),
            silence_handler: Mutex::new(None),
        });
        self.state.routers.lock().unwrap().push(router.clone());
        Ok(router)
    }
}

pub(crate) struct FakeRouter {
    id: String,
    state: Arc<State>,
    closed: AtomicBool,
    volumes_handler: Mutex<Option<EventHandler<Vec<String>>>>,
    silence_handler: Mutex<Option<EventHandler<()>>>,
}

#[async_trait]
impl RouterHandle for FakeRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        json!({ "codecs": [{ "mimeType": "audio/opus" }, { "mimeType": "video/VP8" }] })
    }

    /// Empty or missing codec lists cannot consume anything
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let has_codecs = rtp_capabilities["codecs"].as_array().is_some_and(|c| !c.is_empty());
        let producer_open = self
            .state
            .producers
            .lock()
            .unwrap()
            .get(producer_id)
            .is_some_and(|p| !p.closed.load(Ordering::SeqCst));
        has_codecs && producer_open
    }

    async fn create_webrtc_transport(
        &self,
        direction: TransportDirection,
    ) -> MediaResult<Arc<dyn TransportHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::RouterError("router closed".into()));
        }
        let transport = Arc::new(FakeTransport {
            id: self.state.next_id("transport"),
            direction,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
            state_handler: Mutex::new(None),
        });
        self.state.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }

    async fn observe_audio_level(&self, producer_id: &str) -> MediaResult<()> {
        self.state.observed.lock().unwrap().push(producer_id.to_string());
        Ok(())
    }

    async fn unobserve_audio_level(&self, producer_id: &str) -> MediaResult<()> {
        let mut observed = self.state.observed.lock().unwrap();
        let index = observed
            .iter()
            .position(|id| id == producer_id)
            .ok_or_else(|| MediaError::RouterError(format!("{producer_id} not observed")))?;
        observed.remove(index);
        Ok(())
    }

    fn on_volumes(&self, handler: EventHandler<Vec<String>>) {
        *self.volumes_handler.lock().unwrap() = Some(handler);
    }

    fn on_silence(&self, handler: EventHandler<()>) {
        *self.silence_handler.lock().unwrap() = Some(handler);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct FakeTransport {
    id: String,
    direction: TransportDirection,
    state: Arc<State>,
    closed: AtomicBool,
    state_handler: Mutex<Option<EventHandler<ConnectionState>>>,
}

impl FakeTransport {
    fn ensure_open(&self) -> MediaResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::TransportError(format!("{} closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportHandle for FakeTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn connection_params(&self) -> Value {
        json!({
            "id": self.id,
            "direction": self.direction,
            "iceParameters": { "usernameFragment": "frag", "password": "pwd", "iceLite": true },
            "iceCandidates": [{ "ip": "127.0.0.1", "port": 40000, "protocol": "udp" }],
            "dtlsParameters": { "role": "auto", "fingerprints": [] },
        })
    }

    async fn connect(&self, _dtls_parameters: Value) -> MediaResult<()> {
        self.ensure_open()?;
        if self.state.fail_connect.swap(false, Ordering::SeqCst) {
            return Err(MediaError::TransportError("dtls handshake failed".into()));
        }
        if let Some(handler) = self.state_handler.lock().unwrap().as_ref() {
            handler(ConnectionState::Connected);
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        _rtp_parameters: Value,
    ) -> MediaResult<Arc<dyn ProducerHandle>> {
        self.ensure_open()?;
        let gate = self.state.produce_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let producer = Arc::new(FakeProducer {
            id: self.state.next_id("producer"),
            kind,
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            score_handler: Mutex::new(None),
            close_handler: Mutex::new(None),
        });
        self.state
            .producers
            .lock()
            .unwrap()
            .insert(producer.id.clone(), producer.clone());
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        _rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Arc<dyn ConsumerHandle>> {
        self.ensure_open()?;
        let kind = self
            .state
            .producers
            .lock()
            .unwrap()
            .get(producer_id)
            .filter(|p| !p.closed.load(Ordering::SeqCst))
            .map(|p| p.kind)
            .ok_or_else(|| MediaError::ConsumerError(format!("producer {producer_id} not found")))?;

        let consumer = Arc::new(FakeConsumer {
            id: self.state.next_id("consumer"),
            producer_id: producer_id.to_string(),
            kind,
            closed: AtomicBool::new(false),
            paused: AtomicBool::new(paused),
            key_frames: AtomicUsize::new(0),
        });
        self.state
            .consumers
            .lock()
            .unwrap()
            .insert(consumer.id.clone(), consumer.clone());
        Ok(consumer)
    }

    fn on_state_change(&self, handler: EventHandler<ConnectionState>) {
        *self.state_handler.lock().unwrap() = Some(handler);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct FakeProducer {
    id: String,
    kind: MediaKind,
    closed: AtomicBool,
    close_count: AtomicUsize,
    paused: AtomicBool,
    score_handler: Mutex<Option<EventHandler<u8>>>,
    close_handler: Mutex<Option<CloseHandler>>,
}

#[async_trait]
impl ProducerHandle for FakeProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn pause(&self) -> MediaResult<()> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> MediaResult<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn on_score(&self, handler: EventHandler<u8>) {
        *self.score_handler.lock().unwrap() = Some(handler);
    }

    fn on_close(&self, handler: CloseHandler) {
        *self.close_handler.lock().unwrap() = Some(handler);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_count.fetch_add(1, Ordering::SeqCst);
        let handler = self.close_handler.lock().unwrap().take();
        if let Some(handler) = handler {
            handler();
        }
    }
}

pub(crate) struct FakeConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    closed: AtomicBool,
    paused: AtomicBool,
    key_frames: AtomicUsize,
}

#[async_trait]
impl ConsumerHandle for FakeConsumer {
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
        json!({ "mid": self.id, "codecs": [] })
    }

    async fn pause(&self) -> MediaResult<()> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> MediaResult<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn request_key_frame(&self) -> MediaResult<()> {
        self.key_frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
