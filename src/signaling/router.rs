#![forbid(unsafe_code)]

// Signaling router - maps request frames to room operations and wraps the outcome in a reply

use super::protocol::{
    ClientFrame, ConnectTransportRequest, ConsumerBatchRequest, CreateConsumerRequest,
    CreatePeerRequest, JoinRoomRequest, PeerRequest, ProduceRequest, ProducerControlRequest, Reply,
    RoomRequest, ToggleMicRequest,
};
use crate::error::{SignalingError, SignalingResult};
use crate::media::{MediaSource, TransportDirection};
use crate::room::{Outbox, RoomManager};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// The connection a request arrived on
#[derive(Clone)]
pub struct Session {
    pub socket_id: String,
    pub outbox: Outbox,
}

fn parse<T: DeserializeOwned>(data: Value) -> SignalingResult<T> {
    serde_json::from_value(data).map_err(|e| SignalingError::ValidationError(e.to_string()))
}

fn reply_data<T: Serialize>(value: T) -> SignalingResult<Value> {
    // Response payloads are plain data and always serialize
    Ok(serde_json::to_value(value).unwrap_or(Value::Null))
}

#[derive(Clone)]
pub struct SignalingRouter {
    rooms: Arc<RoomManager>,
}

impl SignalingRouter {
    pub fn new(rooms: Arc<RoomManager>) -> Self {
        Self { rooms }
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Runs one request to completion. Errors become an `ok: false` reply.
    pub async fn handle(&self, session: &Session, frame: ClientFrame) -> Reply {
        let start = Instant::now();
        let event = frame.event;
        let outcome = self.dispatch(session, &event, frame.data).await;
        let metrics = self.rooms.metrics();
        metrics.observe_request_handling(start.elapsed());

        match outcome {
            Ok(data) => {
                debug!("{} handled for socket {}", event, session.socket_id);
                Reply::ok(frame.id, data)
            }
            Err(e) => {
                warn!(
                    "{} failed for socket {} ({}): {}",
                    event,
                    session.socket_id,
                    e.code(),
                    e
                );
                metrics.inc_errors();
                Reply::err(frame.id, e.to_string())
            }
        }
    }

    async fn dispatch(&self, session: &Session, event: &str, data: Value) -> SignalingResult<Value> {
        let rooms = &self.rooms;
        match event {
            "createRoom" => reply_data(rooms.create_room().await?),
            "createPeer" => {
                let req: CreatePeerRequest = parse(data)?;
                let peer = rooms
                    .create_peer(
                        &req.room_id,
                        &req.name,
                        &session.socket_id,
                        session.outbox.clone(),
                        req.mic_on,
                        req.cam_on,
                    )
                    .await?;
                reply_data(peer)
            }
            "joinRoom" => {
                let req: JoinRoomRequest = parse(data)?;
                let joined = rooms
                    .join_room(
                        &req.room_id,
                        &req.peer_id,
                        req.rtp_capabilities,
                        &session.socket_id,
                        session.outbox.clone(),
                    )
                    .await?;
                reply_data(joined)
            }
            "getRouterRtpCapabilities" => {
                let req: RoomRequest = parse(data)?;
                rooms.get_router_rtp_capabilities(&req.room_id).await
            }
            "createSendTransport" => self.create_transport(data, TransportDirection::Send).await,
            "createRecvTransport" => self.create_transport(data, TransportDirection::Recv).await,
            "connectSendTransport" => self.connect_transport(data, TransportDirection::Send).await,
            "connectRecvTransport" => self.connect_transport(data, TransportDirection::Recv).await,
            "produce" => {
                let req: ProduceRequest = parse(data)?;
                let created = rooms
                    .produce(
                        &req.room_id,
                        &req.peer_id,
                        req.app_data.source,
                        req.kind,
                        req.rtp_parameters,
                    )
                    .await?;
                reply_data(created)
            }
            "createConsumer" => {
                let req: CreateConsumerRequest = parse(data)?;
                let created = rooms
                    .create_consumer(&req.room_id, &req.peer_id, req.producer_id, req.exporter_id, req.paused)
                    .await?;
                reply_data(created)
            }
            "consumerPause" => {
                let req: ConsumerBatchRequest = parse(data)?;
                rooms.pause_consumers(&req.room_id, &req.peer_id, &req.consumer_ids).await?;
                Ok(Value::Null)
            }
            "consumerResume" => {
                let req: ConsumerBatchRequest = parse(data)?;
                rooms.resume_consumers(&req.room_id, &req.peer_id, &req.consumer_ids).await?;
                Ok(Value::Null)
            }
            "camOn" => self.switch_source(data, MediaSource::Video, true).await,
            "camOff" => self.switch_source(data, MediaSource::Video, false).await,
            "screenOn" => self.switch_source(data, MediaSource::Screen, true).await,
            "screenOff" => self.switch_source(data, MediaSource::Screen, false).await,
            "toggleMic" => {
                let req: ToggleMicRequest = parse(data)?;
                rooms.toggle_mic(&req.room_id, &req.peer_id, req.mic_on).await?;
                Ok(Value::Null)
            }
            "producerPause" => {
                let req: ProducerControlRequest = parse(data)?;
                rooms.pause_producer(&req.room_id, &req.peer_id, req.source).await?;
                Ok(Value::Null)
            }
            "producerResume" => {
                let req: ProducerControlRequest = parse(data)?;
                rooms.resume_producer(&req.room_id, &req.peer_id, req.source).await?;
                Ok(Value::Null)
            }
            "endCall" => {
                let req: PeerRequest = parse(data)?;
                rooms.end_call(&req.room_id, &req.peer_id).await?;
                Ok(Value::Null)
            }
            other => Err(SignalingError::ValidationError(format!("unknown event '{other}'"))),
        }
    }

    async fn create_transport(&self, data: Value, direction: TransportDirection) -> SignalingResult<Value> {
        let req: PeerRequest = parse(data)?;
        reply_data(self.rooms.create_transport(&req.room_id, &req.peer_id, direction).await?)
    }

    async fn connect_transport(&self, data: Value, direction: TransportDirection) -> SignalingResult<Value> {
        let req: ConnectTransportRequest = parse(data)?;
        self.rooms
            .connect_transport(&req.room_id, &req.peer_id, direction, req.dtls_parameters)
            .await?;
        Ok(Value::Null)
    }

    async fn switch_source(&self, data: Value, source: MediaSource, on: bool) -> SignalingResult<Value> {
        let req: PeerRequest = parse(data)?;
        if on {
            self.rooms.start_source(&req.room_id, &req.peer_id, source).await?;
        } else {
            self.rooms.stop_source(&req.room_id, &req.peer_id, source).await?;
        }
        Ok(Value::Null)
    }
}
