#![forbid(unsafe_code)]

// Room module - Room store, per-room state and broadcast helpers
pub mod cleanup;
pub mod consumer;
pub mod observer;
pub mod peer;
pub mod producer;
pub mod transport;

pub use consumer::{ConsumerRecord, ConsumerState, Eviction};
pub use peer::{Peer, PeerUpdate, ProducerEntry, ProducerSlot, TransportSlot};

use crate::error::{SignalingError, SignalingResult};
use crate::media::{MediaEngine, MediaKind, MediaSource, RouterHandle};
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{PeerInfo, RoomInfo, ServerEvent};
use chrono::{DateTime, Utc};
use observer::ObserverEvent;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::{Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Push channel to one client connection (pre-serialized JSON frames)
pub type Outbox = mpsc::Sender<Arc<String>>;

/// Observer events are ephemeral UI hints; a full channel drops them.
const OBSERVER_CHANNEL_CAPACITY: usize = 64;

/// A producer that was just closed, reported back so the caller can
/// broadcast and detach it from the audio level observer outside the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedProducer {
    pub peer_id: String,
    pub producer_id: String,
    pub source: MediaSource,
}

/// Room state. Everything in here is guarded by the room's mutex.
pub struct Room {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub owner_id: Option<String>,
    pub(crate) peers: Vec<Peer>,
    pub(crate) consumers: Vec<ConsumerRecord>,
    pub(crate) router: Arc<dyn RouterHandle>,
    pub(crate) events: mpsc::Sender<ObserverEvent>,
}

impl Room {
    fn new(id: String, router: Arc<dyn RouterHandle>, events: mpsc::Sender<ObserverEvent>) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            owner_id: None,
            peers: Vec::new(),
            consumers: Vec::new(),
            router,
            events,
        }
    }

    pub fn peer(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    pub(crate) fn peer_mut(&mut self, peer_id: &str) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.id == peer_id)
    }

    pub(crate) fn require_peer(&self, peer_id: &str) -> SignalingResult<&Peer> {
        self.peer(peer_id).ok_or_else(|| SignalingError::peer_not_found(peer_id))
    }

    pub(crate) fn require_peer_mut(&mut self, peer_id: &str) -> SignalingResult<&mut Peer> {
        self.peer_mut(peer_id).ok_or_else(|| SignalingError::peer_not_found(peer_id))
    }

    pub fn consumers(&self) -> &[ConsumerRecord] {
        &self.consumers
    }

    pub fn joined_peer_ids(&self) -> Vec<String> {
        self.peers.iter().filter(|p| p.is_joined).map(|p| p.id.clone()).collect()
    }

    fn joined_count(&self) -> usize {
        self.peers.iter().filter(|p| p.is_joined).count()
    }

    /// Finds which peer owns `producer_id`, and under which source
    pub(crate) fn find_producer(&self, producer_id: &str) -> Option<(&Peer, MediaSource)> {
        self.peers.iter().find_map(|peer| {
            MediaSource::ALL
                .into_iter()
                .find(|source| peer.producer(*source).id() == Some(producer_id))
                .map(|source| (peer, source))
        })
    }

    /// Closes `peer_id`'s producer for `source`, evicts every consumer
    /// mirroring it and drops its network quality entry.
    /// Returns `None` when there was nothing to close.
    pub(crate) fn close_producer(&mut self, peer_id: &str, source: MediaSource) -> Option<ClosedProducer> {
        let entry = self.peer_mut(peer_id)?.take_producer(source)?;
        entry.handle.close();

        let evicted = self.evict_consumers(Eviction::Producer(&entry.id));
        debug!(
            "Closed {} producer {} of peer {} in room {} ({} consumers evicted)",
            source, entry.id, peer_id, self.id, evicted
        );

        let quality = self.peer_mut(peer_id).and_then(|peer| {
            peer.network_quality.remove(&source).map(|_| peer.network_quality.clone())
        });
        if let Some(network_quality) = quality {
            self.broadcast_joined(&ServerEvent::UpdateNetworkQuality {
                peer_id: peer_id.to_string(),
                network_quality,
            });
        }

        Some(ClosedProducer {
            peer_id: peer_id.to_string(),
            producer_id: entry.id,
            source,
        })
    }

    /// Removes a peer after closing everything it owns or is referenced by:
    /// producers, every consumer it owns or exports, then both transports.
    pub(crate) fn remove_peer(&mut self, peer_id: &str) -> Option<(Peer, Vec<ClosedProducer>)> {
        self.peer(peer_id)?;

        let closed: Vec<ClosedProducer> = MediaSource::ALL
            .into_iter()
            .filter_map(|source| {
                let entry = self.peer_mut(peer_id)?.take_producer(source)?;
                entry.handle.close();
                Some(ClosedProducer {
                    peer_id: peer_id.to_string(),
                    producer_id: entry.id,
                    source,
                })
            })
            .collect();

        let evicted = self.evict_consumers(Eviction::Peer(peer_id));

        let index = self.peers.iter().position(|p| p.id == peer_id)?;
        let mut peer = self.peers.remove(index);
        peer.close_transports();

        if self.owner_id.as_deref() == Some(peer_id) {
            self.owner_id = None;
        }

        info!(
            "Removed peer {} from room {} ({} producers closed, {} consumers evicted)",
            peer_id,
            self.id,
            closed.len(),
            evicted
        );
        Some((peer, closed))
    }

    /// Broadcast an event to every joined peer except `sender_id`
    pub(crate) fn broadcast_except(&self, sender_id: &str, event: &ServerEvent) {
        let Some(json) = serialize_event(event) else {
            return;
        };
        for peer in self.peers.iter().filter(|p| p.is_joined && p.id != sender_id) {
            peer.push(&self.id, json.clone());
        }
    }

    /// Broadcast an event to every joined peer
    pub(crate) fn broadcast_joined(&self, event: &ServerEvent) {
        let Some(json) = serialize_event(event) else {
            return;
        };
        for peer in self.peers.iter().filter(|p| p.is_joined) {
            peer.push(&self.id, json.clone());
        }
    }

    pub(crate) fn broadcast_count(&self) {
        self.broadcast_joined(&ServerEvent::UpdateCount {
            count: self.joined_count(),
        });
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            id: self.id.clone(),
            created_at: self.created_at,
            owner_id: self.owner_id.clone(),
            peers: self.peers.iter().map(Peer::info).collect(),
            consumers: self.consumers.iter().map(ConsumerRecord::snapshot).collect(),
        }
    }
}

fn serialize_event(event: &ServerEvent) -> Option<Arc<String>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!("Failed to serialize {} event: {}", event.name(), e);
            None
        }
    }
}

/// A peer bound to a connection, as `(room_id, peer_id)`
pub type PeerBinding = (String, String);

/// Read-only copy of a room, for lookups that must not hold the lock
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub owner_id: Option<String>,
    pub peers: Vec<PeerInfo>,
    pub consumers: Vec<ConsumerSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSnapshot {
    pub id: String,
    pub peer_id: String,
    pub exporter_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub paused: bool,
}

/// Owns every room and coordinates media + signaling.
///
/// Uses per-room locking: the outer HashMap is protected by a std::sync::RwLock
/// held only for brief lookups and inserts, never across await points. Each room
/// sits behind its own tokio Mutex, taken for state mutation and released
/// around every media engine call.
///
/// `sockets` indexes the peers bound to each open connection. It is a std
/// Mutex and is only ever taken briefly, possibly while a room lock is held,
/// never the other way around.
pub struct RoomManager {
    rooms: Arc<StdRwLock<HashMap<String, Arc<TokioMutex<Room>>>>>,
    sockets: Arc<StdMutex<HashMap<String, Vec<PeerBinding>>>>,
    engine: Arc<dyn MediaEngine>,
    metrics: ServerMetrics,
}

impl RoomManager {
    pub fn new(engine: Arc<dyn MediaEngine>, metrics: ServerMetrics) -> Self {
        Self {
            rooms: Arc::new(StdRwLock::new(HashMap::new())),
            sockets: Arc::new(StdMutex::new(HashMap::new())),
            engine,
            metrics,
        }
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Gets a room lock by ID (brief outer read lock, no await)
    pub(crate) fn get_room(&self, room_id: &str) -> SignalingResult<Arc<TokioMutex<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(room_id)
            .cloned()
            .ok_or_else(|| SignalingError::room_not_found(room_id))
    }

    fn all_rooms(&self) -> Vec<Arc<TokioMutex<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.values().cloned().collect()
    }

    /// Registers a new connection. Peers can only be bound to open connections.
    pub fn open_socket(&self, socket_id: &str) {
        let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        sockets.entry(socket_id.to_string()).or_default();
    }

    /// Forgets a connection and hands back every peer still bound to it.
    /// Later binds to the same socket fail.
    pub(crate) fn close_socket(&self, socket_id: &str) -> Vec<PeerBinding> {
        let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        sockets.remove(socket_id).unwrap_or_default()
    }

    /// Peers currently bound to `socket_id`
    pub fn peers_by_socket(&self, socket_id: &str) -> Vec<PeerBinding> {
        let sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        sockets.get(socket_id).cloned().unwrap_or_default()
    }

    /// Binds a peer to an open connection. Call with the room lock held so
    /// the bind and the room mutation are seen together by a disconnect.
    pub(crate) fn bind_socket(&self, socket_id: &str, room_id: &str, peer_id: &str) -> SignalingResult<()> {
        let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        let bound = sockets
            .get_mut(socket_id)
            .ok_or_else(|| SignalingError::PreconditionFailed(format!("connection {socket_id} is closed")))?;
        if !bound.iter().any(|(r, p)| r == room_id && p == peer_id) {
            bound.push((room_id.to_string(), peer_id.to_string()));
        }
        Ok(())
    }

    pub(crate) fn unbind_socket(&self, socket_id: &str, room_id: &str, peer_id: &str) {
        let mut sockets = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bound) = sockets.get_mut(socket_id) {
            bound.retain(|(r, p)| !(r == room_id && p == peer_id));
        }
    }

    /// Creates a room under a freshly allocated id
    pub async fn create_room(&self) -> SignalingResult<RoomInfo> {
        self.create_room_with_id(Uuid::new_v4().to_string()).await
    }

    /// Creates a room under a caller-chosen id
    ///
    /// # Errors
    /// `AlreadyExists` if the id is taken, `MediaEngineError` if the router
    /// cannot be created
    pub async fn create_room_with_id(&self, room_id: String) -> SignalingResult<RoomInfo> {
        if self.get_room(&room_id).is_ok() {
            return Err(SignalingError::AlreadyExists(format!("room {room_id}")));
        }

        // Router creation is an engine round trip; no lock held
        let router = self.engine.create_router(&room_id).await?;

        let (events_tx, events_rx) = mpsc::channel::<ObserverEvent>(OBSERVER_CHANNEL_CAPACITY);
        {
            let tx = events_tx.clone();
            router.on_volumes(Box::new(move |producer_ids| {
                let _ = tx.try_send(ObserverEvent::Volumes { producer_ids });
            }));
        }
        {
            let tx = events_tx.clone();
            router.on_silence(Box::new(move |()| {
                let _ = tx.try_send(ObserverEvent::Volumes {
                    producer_ids: Vec::new(),
                });
            }));
        }

        let room = Room::new(room_id.clone(), router.clone(), events_tx);
        let info = RoomInfo {
            id: room.id.clone(),
            created_at: room.created_at,
        };

        // Insert under write lock (re-check for concurrent creation)
        let room_arc = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            if rooms.contains_key(&room_id) {
                None
            } else {
                let room_arc = Arc::new(TokioMutex::new(room));
                rooms.insert(room_id.clone(), room_arc.clone());
                Some(room_arc)
            }
        };
        let Some(room_arc) = room_arc else {
            router.close();
            return Err(SignalingError::AlreadyExists(format!("room {room_id}")));
        };

        tokio::spawn(observer::run(events_rx, Arc::downgrade(&room_arc)));

        self.metrics.inc_rooms_created();
        info!("Created room {} on router {}", room_id, router.id());
        Ok(info)
    }

    /// Returns a consistent copy of a room's state
    pub async fn get_room_snapshot(&self, room_id: &str) -> SignalingResult<RoomSnapshot> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.lock().await;
        Ok(room.snapshot())
    }

    /// Router RTP capabilities for a room
    pub async fn get_router_rtp_capabilities(&self, room_id: &str) -> SignalingResult<Value> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.lock().await;
        Ok(room.router.rtp_capabilities())
    }

    /// Removes a room: every peer goes through the regular teardown, then
    /// the router is closed.
    pub async fn remove_room(&self, room_id: &str) -> SignalingResult<()> {
        let room_lock = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms
                .remove(room_id)
                .ok_or_else(|| SignalingError::room_not_found(room_id))?
        };

        let mut room = room_lock.lock().await;
        let peer_ids: Vec<String> = room.peers.iter().map(|p| p.id.clone()).collect();
        for peer_id in &peer_ids {
            if let Some((peer, _)) = room.remove_peer(peer_id) {
                self.unbind_socket(&peer.socket_id, room_id, peer_id);
            }
        }
        room.router.close();

        info!("Removed room {} ({} peers)", room_id, peer_ids.len());
        Ok(())
    }

    /// Gracefully shuts down all rooms
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");
        let room_ids: Vec<String> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.keys().cloned().collect()
        };
        for room_id in &room_ids {
            if let Err(e) = self.remove_room(room_id).await {
                debug!("Room {} already gone during shutdown: {}", room_id, e);
            }
        }
        info!("All rooms shut down ({} total)", room_ids.len());
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Total peer count across rooms; rooms busy with a mutation are skipped
    pub fn total_peer_count(&self) -> usize {
        self.all_rooms()
            .iter()
            .filter_map(|lock| lock.try_lock().ok().map(|room| room.peers.len()))
            .sum()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::media::fake::FakeEngine;

    pub(crate) fn manager() -> (Arc<RoomManager>, FakeEngine) {
        let engine = FakeEngine::new();
        let manager = Arc::new(RoomManager::new(Arc::new(engine.clone()), ServerMetrics::new()));
        (manager, engine)
    }

    /// A connected client: its socket id and the receiving end of its outbox
    pub(crate) struct Client {
        pub socket_id: String,
        pub outbox: Outbox,
        pub inbox: mpsc::Receiver<Arc<String>>,
    }

    impl Client {
        /// Opens a connection on `manager`
        pub(crate) fn connect(manager: &RoomManager) -> Self {
            let (outbox, inbox) = mpsc::channel(64);
            let socket_id = Uuid::new_v4().to_string();
            manager.open_socket(&socket_id);
            Self {
                socket_id,
                outbox,
                inbox,
            }
        }

        /// Drains pushed events as JSON values
        pub(crate) fn events(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(json) = self.inbox.try_recv() {
                out.push(serde_json::from_str(&json).unwrap());
            }
            out
        }

        pub(crate) fn events_named(&mut self, name: &str) -> Vec<Value> {
            self.events().into_iter().filter(|e| e["event"] == name).collect()
        }
    }

    pub(crate) fn caps() -> Value {
        serde_json::json!({ "codecs": [{ "mimeType": "audio/opus" }, { "mimeType": "video/VP8" }] })
    }

    /// Creates and joins a peer
    pub(crate) async fn joined_peer(manager: &RoomManager, room_id: &str, name: &str) -> (String, Client) {
        let client = Client::connect(manager);
        let peer = manager
            .create_peer(room_id, name, &client.socket_id, client.outbox.clone(), false, false)
            .await
            .unwrap();
        manager
            .join_room(room_id, &peer.id, Some(caps()), &client.socket_id, client.outbox.clone())
            .await
            .unwrap();
        (peer.id, client)
    }

    /// Joined peer with both transports created and connected
    pub(crate) async fn connected_peer(manager: &RoomManager, room_id: &str, name: &str) -> (String, Client) {
        use crate::media::TransportDirection;

        let (peer_id, client) = joined_peer(manager, room_id, name).await;
        for direction in [TransportDirection::Send, TransportDirection::Recv] {
            manager.create_transport(room_id, &peer_id, direction).await.unwrap();
            manager
                .connect_transport(room_id, &peer_id, direction, serde_json::json!({ "role": "client" }))
                .await
                .unwrap();
        }
        (peer_id, client)
    }
}
