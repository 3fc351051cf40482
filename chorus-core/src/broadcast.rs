//! Fan-out to every connection owned by this instance.
//!
//! Uses a tokio broadcast channel for O(1) send to all local connections.
//! Each event is encoded once; every connection receives the same
//! `Arc<str>` frame and forwards it to its socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, RwLock};

use crate::protocol::OutboundEvent;
use crate::relay::ConnectionId;

/// Capability the relay uses to reach local connections.
pub trait LocalFanout: Send + Sync {
    /// Deliver `event` to every open local connection. Returns how many
    /// connections it was queued for.
    fn broadcast_to_all_local(&self, event: &OutboundEvent) -> usize;
}

/// Encoded frame as handed to each connection.
pub type Frame = Arc<str>;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub encode_failures: u64,
    pub active_connections: usize,
}

/// A local connection as seen by the fan-out group.
#[derive(Debug, Clone)]
pub struct LocalConnection {
    pub id: ConnectionId,
    pub remote: Option<SocketAddr>,
    pub opened_at: Instant,
}

/// Broadcast group holding every local connection.
pub struct LocalBroadcast {
    sender: broadcast::Sender<Frame>,
    connections: RwLock<HashMap<ConnectionId, LocalConnection>>,
    /// Frames buffered per connection before it starts lagging
    capacity: usize,
    events_sent: AtomicU64,
    encode_failures: AtomicU64,
}

impl LocalBroadcast {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            connections: RwLock::new(HashMap::new()),
            capacity,
            events_sent: AtomicU64::new(0),
            encode_failures: AtomicU64::new(0),
        }
    }

    /// Register a connection and return the receiver its writer drains.
    pub async fn add_connection(
        &self,
        id: ConnectionId,
        remote: Option<SocketAddr>,
    ) -> broadcast::Receiver<Frame> {
        let mut connections = self.connections.write().await;
        connections.insert(
            id,
            LocalConnection {
                id,
                remote,
                opened_at: Instant::now(),
            },
        );
        self.sender.subscribe()
    }

    pub async fn remove_connection(&self, id: &ConnectionId) -> Option<LocalConnection> {
        self.connections.write().await.remove(id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connections(&self) -> Vec<LocalConnection> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            active_connections: self.connection_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver, not tied to a registered connection.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }
}

impl LocalFanout for LocalBroadcast {
    fn broadcast_to_all_local(&self, event: &OutboundEvent) -> usize {
        let frame: Frame = match event.encode() {
            Ok(text) => text.into(),
            Err(e) => {
                self.encode_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Dropping {} event: {e}", event.name());
                return 0;
            }
        };

        self.events_sent.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error: nobody is connected here.
        self.sender.send(frame).unwrap_or(0)
    }
}
