//! Frame delivery to live connections.
//!
//! [`Broadcaster`] is the delivery seam used by the relay. Fan-out sends to
//! every target concurrently and waits for all of them; each target
//! succeeds or fails on its own, so one unreachable peer never blocks the
//! rest.
//!
//! [`ConnectionHub`] is the in-process implementation: each live WebSocket
//! task registers an outbound channel under its connection id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::{mpsc, RwLock};

/// Delivery failure for a single target.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Outcome of one fan-out.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, DeliveryError)>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Deliver one frame to one connection.
    async fn send(&self, connection_id: &str, frame: &[u8]) -> Result<(), DeliveryError>;

    /// Answer the connection that sent the inbound frame.
    async fn reply(&self, connection_id: &str, frame: &[u8]) -> Result<(), DeliveryError> {
        self.send(connection_id, frame).await
    }

    /// Send `frame` to every candidate except `exclude`, concurrently.
    async fn broadcast(&self, frame: &[u8], exclude: &str, candidates: &[String]) -> BroadcastReport {
        let sends = candidates
            .iter()
            .filter(|id| id.as_str() != exclude)
            .map(|id| async move { (id.clone(), self.send(id, frame).await) });

        let mut report = BroadcastReport::default();
        for (id, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered.push(id),
                Err(e) => {
                    log::warn!("Delivery to {id} failed: {e}");
                    report.failed.push((id, e));
                }
            }
        }
        report
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub connections: usize,
}

/// Atomic counters so the send path never takes a write lock.
#[derive(Debug, Default)]
struct AtomicHubStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Registry of outbound channels of live connections on this process.
#[derive(Clone, Default)]
pub struct ConnectionHub {
    outbound: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>>,
    stats: Arc<AtomicHubStats>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the receiver its writer task drains.
    pub async fn register(&self, connection_id: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound.write().await.insert(connection_id.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, connection_id: &str) {
        self.outbound.write().await.remove(connection_id);
    }

    pub async fn contains(&self, connection_id: &str) -> bool {
        self.outbound.read().await.contains_key(connection_id)
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            connections: self.outbound.read().await.len(),
        }
    }
}

#[async_trait]
impl Broadcaster for ConnectionHub {
    async fn send(&self, connection_id: &str, frame: &[u8]) -> Result<(), DeliveryError> {
        let outbound = self.outbound.read().await;
        let result = match outbound.get(connection_id) {
            None => Err(DeliveryError::UnknownConnection(connection_id.to_string())),
            Some(tx) => tx
                .send(frame.to_vec())
                .map_err(|_| DeliveryError::Closed(connection_id.to_string())),
        };

        let counter = if result.is_ok() {
            &self.stats.frames_sent
        } else {
            &self.stats.frames_dropped
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }
}
