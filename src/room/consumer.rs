#![forbid(unsafe_code)]

// Consumer manager - server-side mirrors of remote producers and their eviction

use super::{ConsumerSnapshot, Room, RoomManager};
use crate::error::{SignalingError, SignalingResult};
use crate::media::{ConsumerHandle, MediaKind};
use crate::signaling::protocol::ConsumerCreated;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Active,
    Paused,
}

/// A consumer owned by `peer_id`, mirroring `exporter_id`'s producer
pub struct ConsumerRecord {
    pub id: String,
    pub peer_id: String,
    pub exporter_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub state: ConsumerState,
    pub(crate) handle: Arc<dyn ConsumerHandle>,
}

impl ConsumerRecord {
    pub(crate) fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            id: self.id.clone(),
            peer_id: self.peer_id.clone(),
            exporter_id: self.exporter_id.clone(),
            producer_id: self.producer_id.clone(),
            kind: self.kind,
            paused: self.state == ConsumerState::Paused,
        }
    }
}

/// Which consumers to evict
#[derive(Debug, Clone, Copy)]
pub enum Eviction<'a> {
    /// Every consumer of this producer
    Producer(&'a str),
    /// Every consumer this peer owns or exports
    Peer(&'a str),
}

impl Eviction<'_> {
    fn matches(&self, record: &ConsumerRecord) -> bool {
        match self {
            Eviction::Producer(producer_id) => record.producer_id == *producer_id,
            Eviction::Peer(peer_id) => record.peer_id == *peer_id || record.exporter_id == *peer_id,
        }
    }
}

impl Room {
    /// The one place consumers leave the room: closes and drops every
    /// matching record, returning how many were evicted
    pub(crate) fn evict_consumers(&mut self, target: Eviction<'_>) -> usize {
        let before = self.consumers.len();
        self.consumers.retain(|record| {
            if target.matches(record) {
                record.handle.close();
                false
            } else {
                true
            }
        });
        before - self.consumers.len()
    }
}

enum Batch {
    Pause,
    Resume,
}

impl RoomManager {
    /// Creates a consumer on the peer's recv transport for a producer owned
    /// by another peer of the room.
    pub async fn create_consumer(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: Option<String>,
        exporter_id: Option<String>,
        paused: bool,
    ) -> SignalingResult<ConsumerCreated> {
        let producer_id = producer_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SignalingError::ValidationError("producerId is required".into()))?;

        let room_lock = self.get_room(room_id)?;
        let (transport, rtp_capabilities, exporter) = {
            let room = room_lock.lock().await;
            let peer = room.require_peer(peer_id)?;
            let transport = peer
                .recv_transport
                .handle()
                .cloned()
                .ok_or_else(|| SignalingError::PreconditionFailed("recv transport not found".into()))?;
            let rtp_capabilities = peer
                .rtp_capabilities()
                .cloned()
                .ok_or_else(|| SignalingError::PreconditionFailed("peer has not joined".into()))?;

            let (owner, _) = room.find_producer(&producer_id).ok_or_else(|| {
                SignalingError::PreconditionFailed(format!("producer {producer_id} not found"))
            })?;
            if let Some(claimed) = exporter_id.as_deref() {
                if claimed != owner.id {
                    return Err(SignalingError::ValidationError(format!(
                        "producer {producer_id} is not exported by {claimed}"
                    )));
                }
            }
            if !room.router.can_consume(&producer_id, &rtp_capabilities) {
                return Err(SignalingError::CapabilityMismatch(producer_id));
            }
            (transport, rtp_capabilities, owner.id.clone())
        };

        let consumer = transport.consume(&producer_id, rtp_capabilities, paused).await?;

        // Re-validate: the consumer, the exporter or the producer may be gone
        let mut room = room_lock.lock().await;
        let still_valid = match room.peer(peer_id) {
            None => Err(SignalingError::peer_not_found(peer_id)),
            Some(peer) if !peer.recv_transport.holds(&transport.id()) => Err(
                SignalingError::PreconditionFailed("recv transport closed while consuming".into()),
            ),
            Some(_) => match room.find_producer(&producer_id) {
                Some((owner, _)) if owner.id == exporter => Ok(()),
                _ => Err(SignalingError::PreconditionFailed(format!(
                    "producer {producer_id} closed while consuming"
                ))),
            },
        };
        if let Err(e) = still_valid {
            consumer.close();
            return Err(e);
        }

        let created = ConsumerCreated {
            id: consumer.id(),
            rtp_parameters: consumer.rtp_parameters(),
            kind: consumer.kind(),
            producer_id: producer_id.clone(),
        };
        room.consumers.push(ConsumerRecord {
            id: created.id.clone(),
            peer_id: peer_id.to_string(),
            exporter_id: exporter.clone(),
            producer_id,
            kind: created.kind,
            state: if paused {
                ConsumerState::Paused
            } else {
                ConsumerState::Active
            },
            handle: consumer,
        });
        drop(room);

        self.metrics().inc_consumers_created();
        info!(
            "Peer {} consuming {} from {} in room {}",
            peer_id, created.producer_id, exporter, room_id
        );
        Ok(created)
    }

    /// Pauses the listed consumers owned by the peer. Unknown ids and
    /// consumers owned by someone else are skipped.
    pub async fn pause_consumers(&self, room_id: &str, peer_id: &str, consumer_ids: &[String]) -> SignalingResult<()> {
        self.apply_batch(room_id, peer_id, consumer_ids, Batch::Pause).await
    }

    /// Resumes the listed consumers owned by the peer and asks each for a key frame
    pub async fn resume_consumers(&self, room_id: &str, peer_id: &str, consumer_ids: &[String]) -> SignalingResult<()> {
        self.apply_batch(room_id, peer_id, consumer_ids, Batch::Resume).await
    }

    async fn apply_batch(
        &self,
        room_id: &str,
        peer_id: &str,
        consumer_ids: &[String],
        batch: Batch,
    ) -> SignalingResult<()> {
        let room_lock = self.get_room(room_id)?;
        let targets: Vec<(String, Arc<dyn ConsumerHandle>)> = {
            let room = room_lock.lock().await;
            room.require_peer(peer_id)?;
            room.consumers
                .iter()
                .filter(|c| c.peer_id == peer_id && consumer_ids.contains(&c.id))
                .map(|c| (c.id.clone(), c.handle.clone()))
                .collect()
        };
        if targets.len() < consumer_ids.len() {
            debug!(
                "Peer {} batch skipped {} unknown consumers",
                peer_id,
                consumer_ids.len() - targets.len()
            );
        }

        let mut done = Vec::with_capacity(targets.len());
        let mut last_error = None;
        for (id, handle) in targets {
            let result = match batch {
                Batch::Pause => handle.pause().await,
                Batch::Resume => match handle.resume().await {
                    Ok(()) => {
                        if let Err(e) = handle.request_key_frame().await {
                            debug!("Key frame request for consumer {} failed: {}", id, e);
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
            };
            match result {
                Ok(()) => done.push(id),
                Err(e) => {
                    warn!("Consumer {} batch update failed: {}", id, e);
                    last_error = Some(e);
                }
            }
        }

        {
            let mut room = room_lock.lock().await;
            let state = match batch {
                Batch::Pause => ConsumerState::Paused,
                Batch::Resume => ConsumerState::Active,
            };
            for record in room.consumers.iter_mut().filter(|c| done.contains(&c.id)) {
                record.state = state;
            }
        }

        match last_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::SignalingError;
    use crate::media::{MediaKind, MediaSource};
    use crate::room::test_support::*;
    use serde_json::json;

    #[tokio::test]
    async fn consumer_mirrors_a_remote_producer() {
        let (manager, _engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = connected_peer(&manager, &room.id, "alice").await;
        let (bob, _b) = connected_peer(&manager, &room.id, "bob").await;
        let producer = manager
            .produce(&room.id, &alice, MediaSource::Audio, MediaKind::Audio, json!({}))
            .await
            .unwrap();

        let consumer = manager
            .create_consumer(&room.id, &bob, Some(producer.id.clone()), Some(alice.clone()), true)
            .await
            .unwrap();
        assert_eq!(consumer.producer_id, producer.id);
        assert_eq!(consumer.kind, MediaKind::Audio);

        let snapshot = manager.get_room_snapshot(&room.id).await.unwrap();
        assert_eq!(snapshot.consumers.len(), 1);
        assert_eq!(snapshot.consumers[0].peer_id, bob);
        assert_eq!(snapshot.consumers[0].exporter_id, alice);
        assert!(snapshot.consumers[0].paused);
    }

    #[tokio::test]
    async fn missing_producer_id_is_a_validation_error() {
        let (manager, _engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (bob, _b) = connected_peer(&manager, &room.id, "bob").await;

        let err = manager
            .create_consumer(&room.id, &bob, None, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::ValidationError(_)));
    }

    #[tokio::test]
    async fn wrong_exporter_is_rejected() {
        let (manager, _engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = connected_peer(&manager, &room.id, "alice").await;
        let (bob, _b) = connected_peer(&manager, &room.id, "bob").await;
        let producer = manager
            .produce(&room.id, &alice, MediaSource::Video, MediaKind::Video, json!({}))
            .await
            .unwrap();

        let err = manager
            .create_consumer(&room.id, &bob, Some(producer.id), Some(bob.clone()), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::ValidationError(_)));
    }

    #[tokio::test]
    async fn incompatible_capabilities_are_rejected() {
        let (manager, _engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = connected_peer(&manager, &room.id, "alice").await;
        let producer = manager
            .produce(&room.id, &alice, MediaSource::Video, MediaKind::Video, json!({}))
            .await
            .unwrap();

        let c = Client::connect(&manager);
        let carol = manager
            .create_peer(&room.id, "carol", &c.socket_id, c.outbox.clone(), false, false)
            .await
            .unwrap();
        manager
            .join_room(&room.id, &carol.id, Some(json!({ "codecs": [] })), &c.socket_id, c.outbox.clone())
            .await
            .unwrap();
        manager
            .create_transport(&room.id, &carol.id, crate::media::TransportDirection::Recv)
            .await
            .unwrap();

        let err = manager
            .create_consumer(&room.id, &carol.id, Some(producer.id), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::CapabilityMismatch(_)));
    }

    #[tokio::test]
    async fn closed_producer_cannot_be_consumed() {
        let (manager, _engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = connected_peer(&manager, &room.id, "alice").await;
        let (bob, _b) = connected_peer(&manager, &room.id, "bob").await;
        let producer = manager
            .produce(&room.id, &alice, MediaSource::Video, MediaKind::Video, json!({}))
            .await
            .unwrap();
        manager.stop_source(&room.id, &alice, MediaSource::Video).await.unwrap();

        let err = manager
            .create_consumer(&room.id, &bob, Some(producer.id), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn batch_pause_only_touches_own_consumers() {
        let (manager, engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = connected_peer(&manager, &room.id, "alice").await;
        let (bob, _b) = connected_peer(&manager, &room.id, "bob").await;
        let (carol, _c) = connected_peer(&manager, &room.id, "carol").await;
        let producer = manager
            .produce(&room.id, &alice, MediaSource::Video, MediaKind::Video, json!({}))
            .await
            .unwrap();
        let bobs = manager
            .create_consumer(&room.id, &bob, Some(producer.id.clone()), None, false)
            .await
            .unwrap();
        let carols = manager
            .create_consumer(&room.id, &carol, Some(producer.id.clone()), None, false)
            .await
            .unwrap();

        manager
            .pause_consumers(&room.id, &bob, &[bobs.id.clone(), carols.id.clone(), "nope".into()])
            .await
            .unwrap();
        assert!(engine.consumer_paused(&bobs.id));
        assert!(!engine.consumer_paused(&carols.id));

        manager.resume_consumers(&room.id, &bob, &[bobs.id.clone()]).await.unwrap();
        assert!(!engine.consumer_paused(&bobs.id));
        assert_eq!(engine.key_frame_requests(&bobs.id), 1);

        let snapshot = manager.get_room_snapshot(&room.id).await.unwrap();
        assert!(snapshot.consumers.iter().all(|c| !c.paused));
    }
}
