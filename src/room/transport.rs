#![forbid(unsafe_code)]

// Transport coordinator - per-peer send/recv WebRTC transports

use super::{RoomManager, TransportSlot};
use crate::error::{SignalingError, SignalingResult};
use crate::media::{ConnectionState, TransportDirection};
use crate::signaling::protocol::TransportCreated;
use serde_json::Value;
use tracing::{debug, info, warn};

impl RoomManager {
    /// Creates the peer's transport for `direction` and returns the
    /// parameters the client needs to mirror it.
    pub async fn create_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        direction: TransportDirection,
    ) -> SignalingResult<TransportCreated> {
        let room_lock = self.get_room(room_id)?;

        let router = {
            let room = room_lock.lock().await;
            let peer = room.require_peer(peer_id)?;
            if !peer.transport(direction).is_absent() {
                return Err(SignalingError::PreconditionFailed(format!(
                    "{direction} transport already exists"
                )));
            }
            room.router.clone()
        };

        // Slow engine call; no room lock held
        let transport = router.create_webrtc_transport(direction).await?;
        let transport_id = transport.id();

        {
            let peer_id = peer_id.to_string();
            let transport_id = transport_id.clone();
            transport.on_state_change(Box::new(move |state| match state {
                ConnectionState::Failed | ConnectionState::Disconnected => {
                    warn!(
                        "{} transport {} of peer {} is {:?}",
                        direction, transport_id, peer_id, state
                    );
                }
                _ => debug!(
                    "{} transport {} of peer {} is {:?}",
                    direction, transport_id, peer_id, state
                ),
            }));
        }

        let transport_params = transport.connection_params();

        {
            let mut room = room_lock.lock().await;
            let slot = match room.peer_mut(peer_id) {
                Some(peer) => peer.transport_mut(direction),
                None => {
                    transport.close();
                    return Err(SignalingError::peer_not_found(peer_id));
                }
            };
            if !slot.is_absent() {
                transport.close();
                return Err(SignalingError::PreconditionFailed(format!(
                    "{direction} transport already exists"
                )));
            }
            *slot = TransportSlot::Created(transport);
        }

        info!(
            "Created {} transport {} for peer {} in room {}",
            direction, transport_id, peer_id, room_id
        );
        Ok(TransportCreated { transport_params })
    }

    /// Completes the DTLS handshake on an existing, not yet connected transport
    pub async fn connect_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        direction: TransportDirection,
        dtls_parameters: Value,
    ) -> SignalingResult<()> {
        let room_lock = self.get_room(room_id)?;

        let transport = {
            let room = room_lock.lock().await;
            match room.require_peer(peer_id)?.transport(direction) {
                TransportSlot::Absent => {
                    return Err(SignalingError::PreconditionFailed(format!(
                        "{direction} transport not found"
                    )));
                }
                TransportSlot::Connected(_) => {
                    return Err(SignalingError::PreconditionFailed(format!(
                        "{direction} transport already connected"
                    )));
                }
                TransportSlot::Created(handle) => handle.clone(),
            }
        };

        transport.connect(dtls_parameters).await?;
        let transport_id = transport.id();

        let mut room = room_lock.lock().await;
        let slot = room.require_peer_mut(peer_id)?.transport_mut(direction);
        if !slot.holds(&transport_id) {
            return Err(SignalingError::PreconditionFailed(format!(
                "{direction} transport closed while connecting"
            )));
        }
        *slot = TransportSlot::Connected(transport);

        info!(
            "Connected {} transport {} for peer {} in room {}",
            direction, transport_id, peer_id, room_id
        );
        Ok(())
    }
}
