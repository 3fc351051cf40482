//! Publish/subscribe backbone shared by every relay instance.
//!
//! Delivery contract:
//! - at-least-once per subscriber,
//! - publish order within one channel,
//! - no ordering across channels.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BackboneError;

/// Channel-based pub/sub medium.
#[async_trait]
pub trait PubSubBackbone: Send + Sync {
    /// Publish `payload` on `channel`. Returns how many subscribers the
    /// backbone handed it to.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BackboneError>;

    /// Subscribe to a single channel.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackboneError>;
}

/// Ordered stream of payloads from one channel.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    /// Create a subscription and the sender an adapter feeds it through.
    pub fn channel(channel: impl Into<String>) -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                channel: channel.into(),
                rx,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the backbone side has gone away.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}
