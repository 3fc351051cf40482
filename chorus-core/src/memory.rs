//! In-process backbone.
//!
//! One `MemoryBackbone` may be cloned into several [`Relay`](crate::Relay)
//! instances to model separate processes sharing one backbone. Every call
//! yields to the scheduler first so handlers interleave the way they do
//! against a networked store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backbone::{PubSubBackbone, Subscription};
use crate::counter::SharedCounter;
use crate::error::BackboneError;

/// Publishes kept for inspection; older entries are dropped first.
pub const PUBLISH_LOG_CAPACITY: usize = 1024;

#[derive(Default)]
struct Inner {
    values: Mutex<HashMap<String, i64>>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
    published: Mutex<VecDeque<(String, String)>>,
    offline: AtomicBool,
}

/// Shared in-memory key/value store plus pub/sub hub.
#[derive(Clone, Default)]
pub struct MemoryBackbone {
    inner: Arc<Inner>,
}

impl MemoryBackbone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the integer stored under `key`.
    pub fn counter(&self, key: impl Into<String>) -> MemoryCounter {
        MemoryCounter {
            backbone: self.clone(),
            key: key.into(),
        }
    }

    /// Simulate losing (or regaining) the backbone.
    pub fn set_available(&self, available: bool) {
        self.inner.offline.store(!available, Ordering::SeqCst);
    }

    /// Raw value of `key`, bypassing availability. `None` when absent.
    pub fn value(&self, key: &str) -> Option<i64> {
        lock(&self.inner.values).get(key).copied()
    }

    /// Overwrite `key`, bypassing availability.
    pub fn set_value(&self, key: &str, value: i64) {
        lock(&self.inner.values).insert(key.to_string(), value);
    }

    /// The most recent successful publishes, oldest first, at most
    /// [`PUBLISH_LOG_CAPACITY`] of them.
    pub fn published(&self) -> Vec<(String, String)> {
        lock(&self.inner.published).iter().cloned().collect()
    }

    /// Payloads published on `channel`, in order.
    pub fn published_on(&self, channel: &str) -> Vec<String> {
        lock(&self.inner.published)
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p.clone())
            .collect()
    }

    async fn round_trip(&self, op: &'static str) -> Result<(), BackboneError> {
        tokio::task::yield_now().await;
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(BackboneError::Unavailable(format!("{op}: backbone offline")));
        }
        Ok(())
    }

    fn update<F>(&self, key: &str, f: F) -> i64
    where
        F: FnOnce(i64) -> i64,
    {
        let mut values = lock(&self.inner.values);
        let slot = values.entry(key.to_string()).or_insert(0);
        *slot = f(*slot);
        *slot
    }
}

#[async_trait]
impl PubSubBackbone for MemoryBackbone {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BackboneError> {
        self.round_trip("PUBLISH").await?;

        let delivered = {
            let mut channels = lock(&self.inner.channels);
            match channels.get_mut(channel) {
                Some(subscribers) => {
                    subscribers.retain(|tx| tx.send(payload.to_string()).is_ok());
                    subscribers.len()
                }
                None => 0,
            }
        };
        let mut log = lock(&self.inner.published);
        if log.len() == PUBLISH_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back((channel.to_string(), payload.to_string()));
        drop(log);
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackboneError> {
        self.round_trip("SUBSCRIBE").await.map_err(|e| BackboneError::Subscribe {
            channel: channel.to_string(),
            reason: e.to_string(),
        })?;

        let (tx, subscription) = Subscription::channel(channel);
        lock(&self.inner.channels)
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(subscription)
    }
}

/// [`SharedCounter`] over a [`MemoryBackbone`] key.
#[derive(Clone)]
pub struct MemoryCounter {
    backbone: MemoryBackbone,
    key: String,
}

impl MemoryCounter {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl SharedCounter for MemoryCounter {
    async fn ensure_initialized(&self) -> Result<(), BackboneError> {
        self.backbone.round_trip("SETNX").await?;
        lock(&self.backbone.inner.values)
            .entry(self.key.clone())
            .or_insert(0);
        Ok(())
    }

    async fn increment(&self) -> Result<i64, BackboneError> {
        self.backbone.round_trip("INCR").await?;
        Ok(self.backbone.update(&self.key, |v| v + 1))
    }

    async fn decrement(&self) -> Result<i64, BackboneError> {
        self.backbone.round_trip("DECR").await?;
        Ok(self.backbone.update(&self.key, |v| v - 1))
    }

    async fn read(&self) -> Result<i64, BackboneError> {
        self.backbone.round_trip("GET").await?;
        Ok(self.backbone.value(&self.key).unwrap_or(0))
    }

    async fn adjust_by(&self, delta: i64) -> Result<i64, BackboneError> {
        self.backbone.round_trip("EVAL").await?;
        Ok(self.backbone.update(&self.key, |v| (v + delta).max(0)))
    }
}

// A poisoned map is still structurally valid; keep serving it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
