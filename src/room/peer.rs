#![forbid(unsafe_code)]

// Peer store - participants, their transport/producer slots and lifecycle

use super::{Outbox, RoomManager};
use crate::error::{SignalingError, SignalingResult};
use crate::media::{MediaSource, ProducerHandle, TransportDirection, TransportHandle};
use crate::signaling::protocol::{
    JoinResponse, PeerInfo, PeerStatus, ProducerData, RemotePeer, ServerEvent,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maximum peer display name length (in characters)
const MAX_PEER_NAME_LEN: usize = 64;

/// One of a peer's two transports
#[derive(Clone, Default)]
pub enum TransportSlot {
    #[default]
    Absent,
    Created(Arc<dyn TransportHandle>),
    Connected(Arc<dyn TransportHandle>),
}

impl TransportSlot {
    pub fn handle(&self) -> Option<&Arc<dyn TransportHandle>> {
        match self {
            TransportSlot::Absent => None,
            TransportSlot::Created(h) | TransportSlot::Connected(h) => Some(h),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, TransportSlot::Absent)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, TransportSlot::Connected(_))
    }

    /// Whether this slot still holds the transport with id `transport_id`
    pub fn holds(&self, transport_id: &str) -> bool {
        self.handle().is_some_and(|h| h.id() == transport_id)
    }
}

#[derive(Clone)]
pub struct ProducerEntry {
    pub id: String,
    pub handle: Arc<dyn ProducerHandle>,
}

/// One of a peer's three producer slots (audio, video, screen)
#[derive(Clone, Default)]
pub enum ProducerSlot {
    #[default]
    Absent,
    Open(ProducerEntry),
    Paused(ProducerEntry),
}

impl ProducerSlot {
    pub fn entry(&self) -> Option<&ProducerEntry> {
        match self {
            ProducerSlot::Absent => None,
            ProducerSlot::Open(e) | ProducerSlot::Paused(e) => Some(e),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.entry().map(|e| e.id.as_str())
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, ProducerSlot::Paused(_))
    }
}

/// A participant in a room.
///
/// `mic_on` / `cam_on` are the declared intent and may be true while no
/// producer exists yet.
pub struct Peer {
    pub id: String,
    pub room_id: String,
    pub socket_id: String,
    pub name: String,
    pub is_joined: bool,
    pub is_owner: bool,
    pub mic_on: bool,
    pub cam_on: bool,
    pub network_quality: BTreeMap<MediaSource, u8>,
    pub(crate) rtp_capabilities: Option<Value>,
    pub(crate) send_transport: TransportSlot,
    pub(crate) recv_transport: TransportSlot,
    audio: ProducerSlot,
    video: ProducerSlot,
    screen: ProducerSlot,
    outbox: Outbox,
}

impl Peer {
    fn new(room_id: &str, name: String, socket_id: &str, outbox: Outbox, is_owner: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            socket_id: socket_id.to_string(),
            name,
            is_joined: false,
            is_owner,
            mic_on: false,
            cam_on: false,
            network_quality: BTreeMap::new(),
            rtp_capabilities: None,
            send_transport: TransportSlot::Absent,
            recv_transport: TransportSlot::Absent,
            audio: ProducerSlot::Absent,
            video: ProducerSlot::Absent,
            screen: ProducerSlot::Absent,
            outbox,
        }
    }

    pub fn rtp_capabilities(&self) -> Option<&Value> {
        self.rtp_capabilities.as_ref()
    }

    pub fn transport(&self, direction: TransportDirection) -> &TransportSlot {
        match direction {
            TransportDirection::Send => &self.send_transport,
            TransportDirection::Recv => &self.recv_transport,
        }
    }

    pub(crate) fn transport_mut(&mut self, direction: TransportDirection) -> &mut TransportSlot {
        match direction {
            TransportDirection::Send => &mut self.send_transport,
            TransportDirection::Recv => &mut self.recv_transport,
        }
    }

    pub fn producer(&self, source: MediaSource) -> &ProducerSlot {
        match source {
            MediaSource::Audio => &self.audio,
            MediaSource::Video => &self.video,
            MediaSource::Screen => &self.screen,
        }
    }

    pub(crate) fn producer_mut(&mut self, source: MediaSource) -> &mut ProducerSlot {
        match source {
            MediaSource::Audio => &mut self.audio,
            MediaSource::Video => &mut self.video,
            MediaSource::Screen => &mut self.screen,
        }
    }

    /// Empties a producer slot, handing back whatever was in it
    pub(crate) fn take_producer(&mut self, source: MediaSource) -> Option<ProducerEntry> {
        match std::mem::take(self.producer_mut(source)) {
            ProducerSlot::Absent => None,
            ProducerSlot::Open(e) | ProducerSlot::Paused(e) => Some(e),
        }
    }

    pub(crate) fn close_transports(&mut self) {
        for slot in [&mut self.send_transport, &mut self.recv_transport] {
            if let Some(handle) = std::mem::take(slot).handle() {
                handle.close();
            }
        }
    }

    /// Rebinds the peer to a (possibly new) connection
    pub(crate) fn rebind(&mut self, socket_id: &str, outbox: Outbox) {
        if self.socket_id != socket_id {
            debug!("Peer {} moved from socket {} to {}", self.id, self.socket_id, socket_id);
            self.socket_id = socket_id.to_string();
        }
        self.outbox = outbox;
    }

    /// Queue a pre-serialized event on this peer's connection
    pub(crate) fn push(&self, room_id: &str, json: Arc<String>) {
        match self.outbox.try_send(json) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Dropping event for peer {} in room {}: channel full",
                    self.id, room_id
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    "Peer {} channel closed in room {} (likely disconnecting)",
                    self.id, room_id
                );
            }
        }
    }

    pub fn producers_data(&self) -> Vec<ProducerData> {
        MediaSource::ALL
            .into_iter()
            .filter_map(|source| {
                self.producer(source).id().map(|id| ProducerData {
                    producer_id: id.to_string(),
                    source,
                })
            })
            .collect()
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            room_id: self.room_id.clone(),
            socket_id: self.socket_id.clone(),
            is_joined: self.is_joined,
            rtp_capabilities: self.rtp_capabilities.clone(),
            cam_on: self.cam_on,
            mic_on: self.mic_on,
        }
    }

    pub fn remote_view(&self) -> RemotePeer {
        RemotePeer {
            id: self.id.clone(),
            room_id: self.room_id.clone(),
            name: self.name.clone(),
            is_joined: self.is_joined,
            cam_on: self.cam_on,
            mic_on: self.mic_on,
            network_quality: self.network_quality.clone(),
            producers_data: self.producers_data(),
            status: if self.outbox.is_closed() {
                PeerStatus::Offline
            } else {
                PeerStatus::Online
            },
        }
    }
}

/// Replacement values for the mutable, client-visible peer fields
#[derive(Debug, Clone, Default)]
pub struct PeerUpdate {
    pub name: Option<String>,
    pub mic_on: Option<bool>,
    pub cam_on: Option<bool>,
}

fn validate_name(name: &str) -> SignalingResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SignalingError::ValidationError("name must not be empty".into()));
    }
    if name.chars().count() > MAX_PEER_NAME_LEN {
        return Err(SignalingError::ValidationError(format!(
            "name exceeds {MAX_PEER_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

impl RoomManager {
    /// Creates a peer in an existing room. The first peer of a room with no
    /// owner becomes its owner.
    pub async fn create_peer(
        &self,
        room_id: &str,
        name: &str,
        socket_id: &str,
        outbox: Outbox,
        mic_on: bool,
        cam_on: bool,
    ) -> SignalingResult<PeerInfo> {
        let name = validate_name(name)?;
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.lock().await;

        let is_owner = room.owner_id.is_none();
        let mut peer = Peer::new(room_id, name, socket_id, outbox, is_owner);
        peer.mic_on = mic_on;
        peer.cam_on = cam_on;

        if room.peer(&peer.id).is_some() {
            return Err(SignalingError::AlreadyExists(format!("peer {}", peer.id)));
        }
        // Fails once the connection has been cleaned up
        self.bind_socket(socket_id, room_id, &peer.id)?;
        if is_owner {
            room.owner_id = Some(peer.id.clone());
        }

        let info = peer.info();
        room.peers.push(peer);
        self.metrics().inc_peers_created();

        info!(
            "Peer {} ({}) created in room {}{}",
            info.id,
            info.name,
            room_id,
            if is_owner { " as owner" } else { "" }
        );
        Ok(info)
    }

    /// Marks a peer joined and returns the room as it sees it.
    ///
    /// The first join stores the capabilities and announces the peer to the
    /// others. Repeating the call only rebinds the connection.
    pub async fn join_room(
        &self,
        room_id: &str,
        peer_id: &str,
        rtp_capabilities: Option<Value>,
        socket_id: &str,
        outbox: Outbox,
    ) -> SignalingResult<JoinResponse> {
        let rtp_capabilities = rtp_capabilities
            .filter(|caps| !caps.is_null())
            .ok_or_else(|| SignalingError::ValidationError("rtpCapabilities is required".into()))?;

        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.lock().await;

        let peer = room.require_peer_mut(peer_id)?;
        if peer.socket_id != socket_id {
            self.bind_socket(socket_id, room_id, peer_id)?;
            self.unbind_socket(&peer.socket_id, room_id, peer_id);
        }
        peer.rebind(socket_id, outbox);
        let first_join = !peer.is_joined;
        if first_join {
            peer.is_joined = true;
            peer.rtp_capabilities = Some(rtp_capabilities);
        }
        let info = peer.info();
        let view = peer.remote_view();

        let remote_peers = room
            .peers
            .iter()
            .filter(|p| p.is_joined && p.id != peer_id)
            .map(Peer::remote_view)
            .collect();

        if first_join {
            room.broadcast_except(peer_id, &ServerEvent::PeerReady { peer: view });
            room.broadcast_count();
            self.metrics().inc_joins();
            info!("Peer {} joined room {}", peer_id, room_id);
        } else {
            debug!("Peer {} re-joined room {} (no-op)", peer_id, room_id);
        }

        Ok(JoinResponse {
            peer: info,
            remote_peers,
        })
    }

    pub async fn get_peer(&self, room_id: &str, peer_id: &str) -> SignalingResult<PeerInfo> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.lock().await;
        Ok(room.require_peer(peer_id)?.info())
    }

    /// Remote views of every joined peer in the room
    pub async fn get_remote_peers(&self, room_id: &str) -> SignalingResult<Vec<RemotePeer>> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.lock().await;
        Ok(room.peers.iter().filter(|p| p.is_joined).map(Peer::remote_view).collect())
    }

    pub async fn update_peer(
        &self,
        room_id: &str,
        peer_id: &str,
        update: PeerUpdate,
    ) -> SignalingResult<PeerInfo> {
        let name = update.name.as_deref().map(validate_name).transpose()?;
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.lock().await;
        let peer = room.require_peer_mut(peer_id)?;

        if let Some(name) = name {
            peer.name = name;
        }
        if let Some(mic_on) = update.mic_on {
            peer.mic_on = mic_on;
        }
        if let Some(cam_on) = update.cam_on {
            peer.cam_on = cam_on;
        }
        Ok(peer.info())
    }

    /// Removes a peer together with its transports, producers and every
    /// consumer that references it. Remaining peers are not notified; that
    /// is the disconnect coordinator's job.
    pub async fn delete_peer(&self, room_id: &str, peer_id: &str) -> SignalingResult<()> {
        let room_lock = self.get_room(room_id)?;
        let (router, closed) = {
            let mut room = room_lock.lock().await;
            let (peer, closed) = room
                .remove_peer(peer_id)
                .ok_or_else(|| SignalingError::peer_not_found(peer_id))?;
            self.unbind_socket(&peer.socket_id, room_id, peer_id);
            (room.router.clone(), closed)
        };
        super::producer::detach_audio(&router, &closed).await;
        Ok(())
    }
}
