#![forbid(unsafe_code)]

// Worker pool management for mediasoup

use super::config::MediaConfig;
use crate::media::types::{MediaError, MediaResult};
use mediasoup::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error, info};

/// A worker and the WebRTC server listening on its dedicated port
struct PooledWorker {
    worker: Worker,
    webrtc_server: WebRtcServer,
    routers: AtomicUsize,
}

/// Fixed pool of mediasoup workers. Routers go to the worker hosting the
/// fewest of them.
pub struct WorkerManager {
    workers: Vec<PooledWorker>,
    // Keeps the worker threads' owner alive for the pool's lifetime
    _manager: mediasoup::worker_manager::WorkerManager,
}

impl WorkerManager {
    /// Starts `num_workers` workers, each with its own WebRTC server
    ///
    /// # Errors
    /// Returns `MediaError::WorkerError` if a worker or its server can't start
    pub async fn new(config: &MediaConfig) -> MediaResult<Self> {
        let num_workers = config.worker_config.num_workers.max(1);
        info!("Creating WorkerManager with {} workers", num_workers);

        let manager = mediasoup::worker_manager::WorkerManager::new();
        let mut workers = Vec::with_capacity(num_workers);

        for index in 0..num_workers {
            let worker = manager
                .create_worker(config.worker_config.to_worker_settings())
                .await
                .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))?;
            let worker_id = worker.id();
            Self::setup_worker_handlers(&worker, index);

            let listen_info = config.listen_info(index);
            let port = listen_info.port.unwrap_or_default();
            let webrtc_server = worker
                .create_webrtc_server(WebRtcServerOptions::new(WebRtcServerListenInfos::new(listen_info)))
                .await
                .map_err(|e| {
                    MediaError::WorkerError(format!(
                        "Failed to create WebRtcServer on port {port} for worker {worker_id}: {e}"
                    ))
                })?;
            info!("Worker {} (index {}) serving RTC on UDP port {}", worker_id, index, port);

            workers.push(PooledWorker {
                worker,
                webrtc_server,
                routers: AtomicUsize::new(0),
            });
        }

        Ok(Self {
            workers,
            _manager: manager,
        })
    }

    fn setup_worker_handlers(worker: &Worker, index: usize) {
        let worker_id = worker.id();
        worker
            .on_dead(move |reason| {
                error!("Worker {} (index {}) died: {:?}", worker_id, index, reason);
            })
            .detach();
    }

    /// Picks the live worker hosting the fewest routers and counts the new one.
    /// The returned guard gives the slot back when dropped.
    pub fn acquire(&self) -> MediaResult<WorkerLease> {
        let (index, pooled) = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| !w.worker.closed())
            .min_by_key(|(_, w)| w.routers.load(Ordering::Relaxed))
            .ok_or_else(|| MediaError::WorkerError("No workers available".to_string()))?;

        let routers = pooled.routers.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Selected worker {} (index {}, {} routers)", pooled.worker.id(), index, routers);

        Ok(WorkerLease {
            worker: pooled.worker.clone(),
            webrtc_server: pooled.webrtc_server.clone(),
            index,
        })
    }

    pub fn release(&self, lease: &WorkerLease) {
        if let Some(pooled) = self.workers.get(lease.index) {
            let _ = pooled
                .routers
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

/// A router's claim on one pooled worker
#[derive(Clone)]
pub struct WorkerLease {
    pub worker: Worker,
    pub webrtc_server: WebRtcServer,
    index: usize,
}
