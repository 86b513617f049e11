#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientFrame, Reply};
use super::router::{Session, SignalingRouter};
use crate::metrics::ServerMetrics;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At the 100 msg/s rate limit this is 640ms of burst; anything older is stale.
const CHANNEL_CAPACITY: usize = 64;

/// Close the connection when nothing arrives for this long
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How long to wait for queued frames to flush after the client goes away
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Token bucket: burst capacity
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// 1 token in microseconds, for integer math
const TOKEN_US: u64 = 1_000_000;
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Per-connection token bucket
struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

impl RateLimiter {
    fn new(now: Instant) -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: now,
            warned: false,
        }
    }

    /// Takes a token. `Err(first)` when limited; `first` is true only for
    /// the first rejection of a burst.
    fn check(&mut self, now: Instant) -> Result<(), bool> {
        let elapsed_us = u64::try_from(now.duration_since(self.last_refill).as_micros()).unwrap_or(u64::MAX);
        self.last_refill = now;
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(RATE_LIMIT_REFILL_RATE))
            .min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            Ok(())
        } else {
            let first = !self.warned;
            self.warned = true;
            Err(first)
        }
    }
}

/// Serialize a frame and queue it as pre-serialized JSON
fn send_json<T: Serialize>(sender: &mpsc::Sender<Arc<String>>, msg: &T) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Handles a single WebSocket connection. Every request runs in its own
/// task so a slow engine call never blocks the rest of the connection.
pub async fn handle_connection(
    socket: WebSocket,
    router: SignalingRouter,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let socket_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", socket_id);
    router.rooms().open_socket(&socket_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_socket_id = socket_id.clone();
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for socket: {}", send_socket_id);
    });

    let session = Session {
        socket_id: socket_id.clone(),
        outbox: tx.clone(),
    };
    let mut limiter = RateLimiter::new(Instant::now());

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for socket {}", socket_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                if let Err(first) = limiter.check(Instant::now()) {
                    if first {
                        warn!("Rate limit exceeded for socket {}", socket_id);
                        let _ = send_json(
                            &tx,
                            &Reply::err(
                                None,
                                format!("rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"),
                            ),
                        );
                    }
                    continue;
                }

                let frame = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Invalid frame from socket {}: {}", socket_id, e);
                        metrics.inc_errors();
                        let _ = send_json(&tx, &Reply::err(None, format!("invalid frame: {e}")));
                        continue;
                    }
                };

                let router = router.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    let reply = router.handle(&session, frame).await;
                    if let Err(e) = send_json(&session.outbox, &reply) {
                        debug!("Reply to socket {} dropped: {}", session.socket_id, e);
                    }
                });
            }
            Message::Close(_) => {
                info!("Client {} closed connection", socket_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                warn!("Unexpected message type from socket {}", socket_id);
            }
        }
    }

    router.rooms().handle_disconnect(&socket_id).await;

    // Requests still in flight hold outbox clones; don't let them pin the
    // connection permit
    drop(session);
    drop(tx);
    if tokio::time::timeout(SEND_DRAIN_TIMEOUT, send_task).await.is_err() {
        debug!("Send task for socket {} still busy, detaching", socket_id);
    }

    info!("Connection handler finished for socket: {}", socket_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_allows_a_burst_then_limits_then_refills() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(start);
        for _ in 0..RATE_LIMIT_MAX_TOKENS {
            assert!(limiter.check(start).is_ok());
        }
        assert_eq!(limiter.check(start), Err(true));
        assert_eq!(limiter.check(start), Err(false));

        let later = start + Duration::from_millis(50);
        assert!(limiter.check(later).is_ok());
    }
}
