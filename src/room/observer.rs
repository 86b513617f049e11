#![forbid(unsafe_code)]

// Quality & speaker observer - turns engine callbacks into room broadcasts

use super::producer::detach_audio;
use super::Room;
use crate::media::MediaSource;
use crate::signaling::protocol::ServerEvent;
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

/// Engine notifications queued by synchronous callbacks for the room's
/// observer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ObserverEvent {
    Score {
        peer_id: String,
        source: MediaSource,
        producer_id: String,
        score: u8,
    },
    ProducerClosed {
        peer_id: String,
        source: MediaSource,
        producer_id: String,
    },
    /// Loudest audio producers first; empty on silence
    Volumes { producer_ids: Vec<String> },
}

/// Background task draining a room's observer events.
/// Holds a Weak reference so it does not keep the room alive; exits once
/// the room is gone.
pub(crate) async fn run(mut rx: mpsc::Receiver<ObserverEvent>, room: Weak<TokioMutex<Room>>) {
    while let Some(event) = rx.recv().await {
        let Some(room_lock) = room.upgrade() else {
            break;
        };

        match event {
            ObserverEvent::Score {
                peer_id,
                source,
                producer_id,
                score,
            } => {
                let mut room = room_lock.lock().await;
                update_quality(&mut room, &peer_id, source, &producer_id, score);
            }
            ObserverEvent::ProducerClosed {
                peer_id,
                source,
                producer_id,
            } => {
                let (router, closed) = {
                    let mut room = room_lock.lock().await;
                    let current = room
                        .peer(&peer_id)
                        .is_some_and(|p| p.producer(source).id() == Some(producer_id.as_str()));
                    if !current {
                        // Closed by us, already handled
                        continue;
                    }
                    let closed = room.close_producer(&peer_id, source);
                    if closed.is_some() {
                        room.broadcast_except(&peer_id, &ServerEvent::source_off(source, &peer_id, &producer_id));
                    }
                    debug!("Producer {} of peer {} closed by the engine", producer_id, peer_id);
                    (room.router.clone(), closed)
                };
                if let Some(c) = closed {
                    detach_audio(&router, &[c]).await;
                }
            }
            ObserverEvent::Volumes { producer_ids } => {
                let room = room_lock.lock().await;
                let peer_ids = speaking_peers(&room, &producer_ids);
                room.broadcast_joined(&ServerEvent::ActiveSpeaker { peer_ids });
            }
        }
    }
    debug!("Observer task exiting");
}

fn update_quality(room: &mut Room, peer_id: &str, source: MediaSource, producer_id: &str, score: u8) {
    let Some(peer) = room.peer_mut(peer_id) else {
        return;
    };
    if peer.producer(source).id() != Some(producer_id) {
        debug!("Ignoring stale score for producer {}", producer_id);
        return;
    }
    peer.network_quality.insert(source, score);
    let network_quality = peer.network_quality.clone();
    room.broadcast_joined(&ServerEvent::UpdateNetworkQuality {
        peer_id: peer_id.to_string(),
        network_quality,
    });
}

/// Maps producer ids to their owning peers, keeping order and dropping
/// producers that no longer exist
fn speaking_peers(room: &Room, producer_ids: &[String]) -> Vec<String> {
    let mut peer_ids: Vec<String> = Vec::with_capacity(producer_ids.len());
    for producer_id in producer_ids {
        if let Some((peer, _)) = room.find_producer(producer_id) {
            if !peer_ids.contains(&peer.id) {
                peer_ids.push(peer.id.clone());
            }
        }
    }
    peer_ids
}
