#![forbid(unsafe_code)]

// Disconnect cleanup - tears a peer down when its connection ends or it hangs up

use super::producer::detach_audio;
use super::RoomManager;
use crate::error::SignalingResult;
use crate::signaling::protocol::ServerEvent;
use tracing::{debug, info};

impl RoomManager {
    /// Cleans up after a closed connection: every peer bound to it is torn
    /// down, room by room. The socket is closed first so a `createPeer`
    /// still in flight cannot bind to it afterwards. Never fails; problems
    /// are logged.
    pub async fn handle_disconnect(&self, socket_id: &str) {
        let bound = self.close_socket(socket_id);
        if bound.is_empty() {
            debug!("Socket {} disconnected without a peer", socket_id);
            return;
        }

        for (room_id, peer_id) in bound {
            if self.close_peer(&room_id, &peer_id).await {
                info!("Socket {} disconnected, peer {} left room {}", socket_id, peer_id, room_id);
            }
        }
    }

    /// Explicit hang-up: same teardown as a disconnect. A peer that is
    /// already gone is a no-op; only a missing room is an error.
    pub async fn end_call(&self, room_id: &str, peer_id: &str) -> SignalingResult<()> {
        self.get_room(room_id)?;
        if self.close_peer(room_id, peer_id).await {
            info!("Peer {} ended the call in room {}", peer_id, room_id);
        } else {
            debug!("Peer {} already left room {}", peer_id, room_id);
        }
        Ok(())
    }

    /// Removes the peer, tells the room and updates the count.
    /// Returns false when the room or peer was already gone.
    async fn close_peer(&self, room_id: &str, peer_id: &str) -> bool {
        let Ok(room_lock) = self.get_room(room_id) else {
            debug!("Room {} already gone while closing peer {}", room_id, peer_id);
            return false;
        };

        let (router, closed) = {
            let mut room = room_lock.lock().await;
            let Some((peer, closed)) = room.remove_peer(peer_id) else {
                return false;
            };
            self.unbind_socket(&peer.socket_id, room_id, peer_id);
            room.broadcast_joined(&ServerEvent::PeerClosed {
                peer_id: peer_id.to_string(),
            });
            room.broadcast_count();
            (room.router.clone(), closed)
        };

        detach_audio(&router, &closed).await;
        self.metrics().inc_cleanups();
        true
    }
}
