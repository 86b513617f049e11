#![forbid(unsafe_code)]

// Producer manager - one producer per (peer, source), intent flags and on/off broadcasts

use super::observer::ObserverEvent;
use super::{ClosedProducer, ProducerEntry, ProducerSlot, Room, RoomManager};
use crate::error::{SignalingError, SignalingResult};
use crate::media::{MediaKind, MediaSource, ProducerHandle, RouterHandle};
use crate::signaling::protocol::{ProducerCreated, ServerEvent};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

/// Forwards a producer's score and close notifications to the room's observer task
fn watch_producer(
    events: &mpsc::Sender<ObserverEvent>,
    peer_id: &str,
    source: MediaSource,
    producer: &Arc<dyn ProducerHandle>,
) {
    let producer_id = producer.id();
    {
        let tx = events.clone();
        let peer_id = peer_id.to_string();
        let producer_id = producer_id.clone();
        producer.on_score(Box::new(move |score| {
            let _ = tx.try_send(ObserverEvent::Score {
                peer_id: peer_id.clone(),
                source,
                producer_id: producer_id.clone(),
                score,
            });
        }));
    }
    {
        let tx = events.clone();
        let peer_id = peer_id.to_string();
        producer.on_close(Box::new(move || {
            let _ = tx.try_send(ObserverEvent::ProducerClosed {
                peer_id,
                source,
                producer_id,
            });
        }));
    }
}

/// Removes closed audio producers from the audio level observer
pub(crate) async fn detach_audio(router: &Arc<dyn RouterHandle>, closed: &[ClosedProducer]) {
    for c in closed.iter().filter(|c| c.source == MediaSource::Audio) {
        if let Err(e) = router.unobserve_audio_level(&c.producer_id).await {
            debug!("Audio producer {} already left the observer: {}", c.producer_id, e);
        }
    }
}

enum MicSwitch {
    On { needs_resume: bool },
    Off(Option<ClosedProducer>),
}

impl Room {
    /// Lock-held half of turning a source off. Returns the closed producer,
    /// which still has to leave the audio level observer.
    fn source_off(&mut self, peer_id: &str, source: MediaSource) -> SignalingResult<Option<ClosedProducer>> {
        let peer = self.require_peer_mut(peer_id)?;
        let intent_changed = match source {
            MediaSource::Audio => std::mem::replace(&mut peer.mic_on, false),
            MediaSource::Video => std::mem::replace(&mut peer.cam_on, false),
            MediaSource::Screen => false,
        };

        let closed = self.close_producer(peer_id, source);
        match &closed {
            Some(c) => {
                self.broadcast_except(peer_id, &ServerEvent::source_off(source, peer_id, &c.producer_id));
            }
            None if intent_changed && source == MediaSource::Audio => {
                self.broadcast_except(
                    peer_id,
                    &ServerEvent::ToggleMic {
                        peer_id: peer_id.to_string(),
                        mic_on: false,
                        producer_id: None,
                    },
                );
            }
            None => debug!("Peer {} has no {} producer to stop", peer_id, source),
        }
        Ok(closed)
    }

    /// Lock-held half of turning a source on. Returns true when a paused
    /// producer still has to be resumed.
    fn source_on(&mut self, peer_id: &str, source: MediaSource) -> SignalingResult<bool> {
        let peer = self.require_peer_mut(peer_id)?;
        let intent_changed = match source {
            MediaSource::Audio => !std::mem::replace(&mut peer.mic_on, true),
            MediaSource::Video => !std::mem::replace(&mut peer.cam_on, true),
            MediaSource::Screen => false,
        };

        let (needs_resume, event) = match peer.producer(source) {
            ProducerSlot::Paused(_) => (true, None),
            ProducerSlot::Open(e) if intent_changed => (false, Some(ServerEvent::source_on(source, peer_id, &e.id))),
            ProducerSlot::Absent if intent_changed && source == MediaSource::Audio => (
                false,
                Some(ServerEvent::ToggleMic {
                    peer_id: peer_id.to_string(),
                    mic_on: true,
                    producer_id: None,
                }),
            ),
            _ => (false, None),
        };
        if let Some(event) = event {
            self.broadcast_except(peer_id, &event);
        }
        Ok(needs_resume)
    }
}

impl RoomManager {
    /// Opens a producer on the peer's send transport. An existing producer
    /// for the same source is closed and replaced.
    pub async fn produce(
        &self,
        room_id: &str,
        peer_id: &str,
        source: MediaSource,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> SignalingResult<ProducerCreated> {
        if kind != source.kind() {
            return Err(SignalingError::ValidationError(format!(
                "{source} source requires {} kind, got {kind}",
                source.kind()
            )));
        }

        let room_lock = self.get_room(room_id)?;
        let (transport, router) = {
            let room = room_lock.lock().await;
            let transport = room
                .require_peer(peer_id)?
                .send_transport
                .handle()
                .cloned()
                .ok_or_else(|| SignalingError::PreconditionFailed("send transport not found".into()))?;
            (transport, room.router.clone())
        };

        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id();

        // Re-validate: the peer or its transport may be gone by now
        let replaced = {
            let mut room = room_lock.lock().await;
            let alive = match room.peer(peer_id) {
                None => Err(SignalingError::peer_not_found(peer_id)),
                Some(peer) if !peer.send_transport.holds(&transport.id()) => Err(
                    SignalingError::PreconditionFailed("send transport closed while producing".into()),
                ),
                Some(_) => Ok(()),
            };
            if let Err(e) = alive {
                producer.close();
                return Err(e);
            }

            let replaced = room.close_producer(peer_id, source);
            if let Some(old) = &replaced {
                room.broadcast_except(peer_id, &ServerEvent::source_off(source, peer_id, &old.producer_id));
            }

            watch_producer(&room.events, peer_id, source, &producer);
            let peer = room.require_peer_mut(peer_id)?;
            *peer.producer_mut(source) = ProducerSlot::Open(ProducerEntry {
                id: producer_id.clone(),
                handle: producer.clone(),
            });
            match source {
                MediaSource::Audio => peer.mic_on = true,
                MediaSource::Video => peer.cam_on = true,
                MediaSource::Screen => {}
            }
            room.broadcast_except(peer_id, &ServerEvent::source_on(source, peer_id, &producer_id));
            replaced
        };

        if let Some(old) = replaced {
            detach_audio(&router, &[old]).await;
        }
        if source == MediaSource::Audio {
            if let Err(e) = router.observe_audio_level(&producer_id).await {
                warn!("Failed to observe audio producer {}: {}", producer_id, e);
            }
        }

        self.metrics().inc_producers_created();
        info!(
            "Peer {} producing {} ({}) in room {}",
            peer_id, source, producer_id, room_id
        );
        Ok(ProducerCreated { id: producer_id })
    }

    /// Turns a source off: clears the intent flag, closes the producer,
    /// evicts its consumers and tells the other peers.
    /// Closing an already closed source is a silent no-op.
    pub async fn stop_source(&self, room_id: &str, peer_id: &str, source: MediaSource) -> SignalingResult<()> {
        let room_lock = self.get_room(room_id)?;
        let (router, closed) = {
            let mut room = room_lock.lock().await;
            let closed = room.source_off(peer_id, source)?;
            (room.router.clone(), closed)
        };
        if let Some(c) = closed {
            detach_audio(&router, &[c]).await;
        }
        Ok(())
    }

    /// Turns a source on: sets the intent flag and resumes a paused producer.
    /// With no producer this only records intent; the client produces next.
    pub async fn start_source(&self, room_id: &str, peer_id: &str, source: MediaSource) -> SignalingResult<()> {
        let room_lock = self.get_room(room_id)?;
        let needs_resume = room_lock.lock().await.source_on(peer_id, source)?;
        if needs_resume {
            self.resume_and_announce(&room_lock, peer_id, source).await?;
        }
        Ok(())
    }

    /// Sets (or, with `None`, flips) the peer's microphone. The flip is
    /// decided under the room lock.
    pub async fn toggle_mic(&self, room_id: &str, peer_id: &str, mic_on: Option<bool>) -> SignalingResult<()> {
        let room_lock = self.get_room(room_id)?;
        let (router, switched) = {
            let mut room = room_lock.lock().await;
            let on = match mic_on {
                Some(on) => on,
                None => !room.require_peer(peer_id)?.mic_on,
            };
            let switched = if on {
                MicSwitch::On {
                    needs_resume: room.source_on(peer_id, MediaSource::Audio)?,
                }
            } else {
                MicSwitch::Off(room.source_off(peer_id, MediaSource::Audio)?)
            };
            (room.router.clone(), switched)
        };

        match switched {
            MicSwitch::On { needs_resume: true } => {
                self.resume_and_announce(&room_lock, peer_id, MediaSource::Audio).await?;
            }
            MicSwitch::On { needs_resume: false } => {}
            MicSwitch::Off(closed) => {
                if let Some(c) = closed {
                    detach_audio(&router, &[c]).await;
                }
            }
        }
        Ok(())
    }

    async fn resume_and_announce(
        &self,
        room_lock: &Arc<TokioMutex<Room>>,
        peer_id: &str,
        source: MediaSource,
    ) -> SignalingResult<()> {
        if let Some(producer_id) = self.set_producer_paused(room_lock, peer_id, source, false).await? {
            let room = room_lock.lock().await;
            room.broadcast_except(peer_id, &ServerEvent::source_on(source, peer_id, &producer_id));
        }
        Ok(())
    }

    /// Pauses the peer's producer for `source` without closing it
    pub async fn pause_producer(&self, room_id: &str, peer_id: &str, source: MediaSource) -> SignalingResult<()> {
        let room_lock = self.get_room(room_id)?;
        if let Some(id) = self.set_producer_paused(&room_lock, peer_id, source, true).await? {
            debug!("Paused {} producer {} of peer {}", source, id, peer_id);
        }
        Ok(())
    }

    pub async fn resume_producer(&self, room_id: &str, peer_id: &str, source: MediaSource) -> SignalingResult<()> {
        let room_lock = self.get_room(room_id)?;
        if let Some(id) = self.set_producer_paused(&room_lock, peer_id, source, false).await? {
            debug!("Resumed {} producer {} of peer {}", source, id, peer_id);
        }
        Ok(())
    }

    /// Returns the producer id when its state actually changed
    async fn set_producer_paused(
        &self,
        room_lock: &Arc<TokioMutex<Room>>,
        peer_id: &str,
        source: MediaSource,
        paused: bool,
    ) -> SignalingResult<Option<String>> {
        let entry = {
            let room = room_lock.lock().await;
            match room.require_peer(peer_id)?.producer(source) {
                ProducerSlot::Absent => {
                    return Err(SignalingError::PreconditionFailed(format!(
                        "{source} producer not found"
                    )));
                }
                ProducerSlot::Open(e) if paused => e.clone(),
                ProducerSlot::Paused(e) if !paused => e.clone(),
                _ => return Ok(None),
            }
        };

        if paused {
            entry.handle.pause().await?;
        } else {
            entry.handle.resume().await?;
        }

        let mut room = room_lock.lock().await;
        let slot = room.require_peer_mut(peer_id)?.producer_mut(source);
        if slot.id() != Some(entry.id.as_str()) {
            return Err(SignalingError::PreconditionFailed(format!(
                "{source} producer closed while changing state"
            )));
        }
        let id = entry.id.clone();
        *slot = if paused {
            ProducerSlot::Paused(entry)
        } else {
            ProducerSlot::Open(entry)
        };
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use crate::error::SignalingError;
    use crate::media::{MediaKind, MediaSource};
    use crate::room::test_support::*;
    use serde_json::json;

    #[tokio::test]
    async fn produce_requires_a_send_transport() {
        let (manager, _engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = joined_peer(&manager, &room.id, "alice").await;

        let err = manager
            .produce(&room.id, &alice, MediaSource::Video, MediaKind::Video, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn kind_must_match_source() {
        let (manager, _engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = connected_peer(&manager, &room.id, "alice").await;

        let err = manager
            .produce(&room.id, &alice, MediaSource::Screen, MediaKind::Audio, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::ValidationError(_)));
    }

    #[tokio::test]
    async fn camera_producer_is_announced_to_others() {
        let (manager, _engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, mut a) = connected_peer(&manager, &room.id, "alice").await;
        let (_bob, mut b) = connected_peer(&manager, &room.id, "bob").await;
        a.events();
        b.events();

        let created = manager
            .produce(&room.id, &alice, MediaSource::Video, MediaKind::Video, json!({}))
            .await
            .unwrap();

        let events = b.events_named("peer:camOn");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["data"]["peerId"], alice);
        assert_eq!(events[0]["data"]["producerId"], created.id);
        assert!(a.events().is_empty());
        assert!(manager.get_peer(&room.id, &alice).await.unwrap().cam_on);
    }

    #[tokio::test]
    async fn audio_producer_joins_the_level_observer() {
        let (manager, engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = connected_peer(&manager, &room.id, "alice").await;

        let created = manager
            .produce(&room.id, &alice, MediaSource::Audio, MediaKind::Audio, json!({}))
            .await
            .unwrap();
        assert_eq!(engine.observed_audio(), vec![created.id.clone()]);

        manager.toggle_mic(&room.id, &alice, Some(false)).await.unwrap();
        assert!(engine.observed_audio().is_empty());
    }

    #[tokio::test]
    async fn producing_again_replaces_the_old_producer_and_its_consumers() {
        let (manager, engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = connected_peer(&manager, &room.id, "alice").await;
        let (bob, _b) = connected_peer(&manager, &room.id, "bob").await;

        let first = manager
            .produce(&room.id, &alice, MediaSource::Video, MediaKind::Video, json!({}))
            .await
            .unwrap();
        manager
            .create_consumer(&room.id, &bob, Some(first.id.clone()), None, false)
            .await
            .unwrap();

        let second = manager
            .produce(&room.id, &alice, MediaSource::Video, MediaKind::Video, json!({}))
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(engine.producer_close_count(&first.id), 1);
        assert_eq!(engine.open_producers(), 1);
        let snapshot = manager.get_room_snapshot(&room.id).await.unwrap();
        assert!(snapshot.consumers.is_empty());
    }

    #[tokio::test]
    async fn cam_off_closes_once_and_notifies_once() {
        let (manager, engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = connected_peer(&manager, &room.id, "alice").await;
        let (_bob, mut b) = connected_peer(&manager, &room.id, "bob").await;
        let created = manager
            .produce(&room.id, &alice, MediaSource::Video, MediaKind::Video, json!({}))
            .await
            .unwrap();
        b.events();

        manager.stop_source(&room.id, &alice, MediaSource::Video).await.unwrap();
        manager.stop_source(&room.id, &alice, MediaSource::Video).await.unwrap();

        assert_eq!(engine.producer_close_count(&created.id), 1);
        assert_eq!(b.events_named("peer:camOff").len(), 1);
        assert!(!manager.get_peer(&room.id, &alice).await.unwrap().cam_on);
    }

    #[tokio::test]
    async fn mic_off_broadcasts_and_mic_on_without_producer_is_intent_only() {
        let (manager, engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = connected_peer(&manager, &room.id, "alice").await;
        let (_bob, mut b) = connected_peer(&manager, &room.id, "bob").await;
        manager
            .produce(&room.id, &alice, MediaSource::Audio, MediaKind::Audio, json!({}))
            .await
            .unwrap();
        b.events();

        manager.toggle_mic(&room.id, &alice, Some(false)).await.unwrap();
        let off = b.events_named("peer:toggleMic");
        assert_eq!(off.len(), 1);
        assert_eq!(off[0]["data"]["micOn"], false);
        assert_eq!(engine.open_producers(), 0);

        manager.toggle_mic(&room.id, &alice, None).await.unwrap();
        assert!(manager.get_peer(&room.id, &alice).await.unwrap().mic_on);
        assert_eq!(engine.open_producers(), 0);
        let on = b.events_named("peer:toggleMic");
        assert_eq!(on.len(), 1);
        assert_eq!(on[0]["data"]["micOn"], true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_mic_flips_cancel_out() {
        let (manager, _engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = connected_peer(&manager, &room.id, "alice").await;
        let (_bob, mut b) = connected_peer(&manager, &room.id, "bob").await;
        b.events();

        let flip = || {
            let manager = manager.clone();
            let room_id = room.id.clone();
            let alice = alice.clone();
            tokio::spawn(async move { manager.toggle_mic(&room_id, &alice, None).await })
        };
        let (first, second) = tokio::join!(flip(), flip());
        first.unwrap().unwrap();
        second.unwrap().unwrap();

        assert!(!manager.get_peer(&room.id, &alice).await.unwrap().mic_on);
        let flips: Vec<_> = b
            .events_named("peer:toggleMic")
            .iter()
            .map(|e| e["data"]["micOn"].clone())
            .collect();
        assert_eq!(flips, vec![json!(true), json!(false)]);
    }

    #[tokio::test]
    async fn cam_on_resumes_a_paused_producer() {
        let (manager, engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = connected_peer(&manager, &room.id, "alice").await;
        let (_bob, mut b) = connected_peer(&manager, &room.id, "bob").await;
        let created = manager
            .produce(&room.id, &alice, MediaSource::Video, MediaKind::Video, json!({}))
            .await
            .unwrap();

        manager.pause_producer(&room.id, &alice, MediaSource::Video).await.unwrap();
        assert!(engine.producer_paused(&created.id));
        b.events();

        manager.start_source(&room.id, &alice, MediaSource::Video).await.unwrap();
        assert!(!engine.producer_paused(&created.id));
        let events = b.events_named("peer:camOn");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["data"]["producerId"], created.id);
    }

    #[tokio::test]
    async fn pause_without_producer_fails() {
        let (manager, _engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = connected_peer(&manager, &room.id, "alice").await;

        let err = manager
            .pause_producer(&room.id, &alice, MediaSource::Screen)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn producer_created_for_a_vanished_peer_is_closed() {
        let (manager, engine) = manager();
        let room = manager.create_room().await.unwrap();
        let (alice, _a) = connected_peer(&manager, &room.id, "alice").await;

        let gate = engine.hold_produce();
        let task = {
            let manager = manager.clone();
            let room_id = room.id.clone();
            let alice = alice.clone();
            tokio::spawn(async move {
                manager
                    .produce(&room_id, &alice, MediaSource::Video, MediaKind::Video, json!({}))
                    .await
            })
        };
        gate.wait_entered().await;

        manager.delete_peer(&room.id, &alice).await.unwrap();
        gate.release();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SignalingError::NotFound(_)));
        assert_eq!(engine.open_producers(), 0);
    }
}
