//! Relay core: connection lifecycle and backbone fan-out.
//!
//! ```text
//!  transport                 Relay                      backbone
//!  ─────────                 ─────                      ────────
//!  connect ────────► INCR ─► tracker+1 ─► PUBLISH count ──┐
//!  chat    ────────► PUBLISH text ────────────────────────┤
//!  disconnect ─────► DECR ─► tracker−1 ─► PUBLISH count ──┤
//!                                                         ▼
//!  every local  ◄── handle_delivery ◄── subscription (any instance)
//!  connection
//! ```
//!
//! Messages are never echoed locally: the origin instance sees its own
//! publish through the backbone like every other instance does.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backbone::{PubSubBackbone, Subscription};
use crate::broadcast::LocalFanout;
use crate::counter::SharedCounter;
use crate::error::{BackboneError, ConnectError, RelayError, Result};
use crate::protocol::{
    ChatMessage, CountUpdate, InboundChat, OutboundEvent, CONNECTION_COUNT_UPDATED_CHANNEL,
    FANOUT_CHANNELS, NEW_MESSAGE_CHANNEL,
};
use crate::tracker::ConnectionTracker;

/// Opaque identity of a local connection. Never leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Proof that a connect incremented the shared counter.
///
/// Only [`ConnectionEvents::on_connect`] creates one and
/// [`ConnectionEvents::on_disconnect`] consumes it, so every decrement is
/// paired with exactly one successful increment.
#[derive(Debug)]
pub struct OpenConnection {
    id: ConnectionId,
    count_at_open: i64,
}

impl OpenConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Shared count returned by this connection's increment.
    pub fn count_at_open(&self) -> i64 {
        self.count_at_open
    }
}

/// Values the relay core needs from configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Tag stamped on every chat message this instance fans out
    pub origin_port: u16,
    /// Deadline for the shutdown reconciliation pass
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            origin_port: 3001,
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

/// Lifecycle callbacks the transport invokes.
#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    async fn on_connect(&self, id: ConnectionId) -> Result<OpenConnection, ConnectError>;

    /// Returns `Ok(false)` when the payload carried no message.
    async fn on_inbound_chat(&self, connection: &OpenConnection, chat: InboundChat) -> Result<bool>;

    /// Returns the shared count after the decrement.
    async fn on_disconnect(&self, connection: OpenConnection) -> Result<i64>;
}

/// One relay instance.
pub struct Relay {
    config: RelayConfig,
    counter: Arc<dyn SharedCounter>,
    backbone: Arc<dyn PubSubBackbone>,
    local: Arc<dyn LocalFanout>,
    tracker: ConnectionTracker,
    /// `true` once sealed for shutdown. Counter updates hold a read guard.
    sealed: RwLock<bool>,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        counter: Arc<dyn SharedCounter>,
        backbone: Arc<dyn PubSubBackbone>,
        local: Arc<dyn LocalFanout>,
    ) -> Self {
        Self {
            config,
            counter,
            backbone,
            local,
            tracker: ConnectionTracker::new(),
            sealed: RwLock::new(false),
        }
    }

    /// Initialize the shared counter and subscribe both fan-out channels.
    ///
    /// A failed counter initialization is fatal. Each channel is subscribed
    /// independently; a single failure is logged and the instance runs
    /// degraded, but if no channel can be subscribed the relay cannot fan
    /// out anything and startup fails.
    pub async fn start(self: &Arc<Self>) -> Result<FanoutTasks> {
        self.counter
            .ensure_initialized()
            .await
            .map_err(RelayError::Counter)?;

        let mut tasks = FanoutTasks::default();
        for channel in FANOUT_CHANNELS {
            match self.backbone.subscribe(channel).await {
                Ok(subscription) => {
                    log::info!("Subscribed to {channel} channel");
                    tasks.spawn(channel, self.clone(), subscription);
                }
                Err(e) => {
                    log::error!("Error subscribing to {channel}: {e}");
                    tasks.failures.push(e);
                }
            }
        }

        if tasks.handles.is_empty() {
            let failures = std::mem::take(&mut tasks.failures);
            return Err(RelayError::Unsubscribed(failures));
        }
        Ok(tasks)
    }

    /// Fan one backbone delivery out to every local connection.
    ///
    /// Runs once per delivery regardless of how many connections are open.
    /// Returns how many local connections the event was queued for.
    pub fn handle_delivery(&self, channel: &str, payload: &str) -> usize {
        match channel {
            CONNECTION_COUNT_UPDATED_CHANNEL => match CountUpdate::from_payload(payload) {
                Ok(update) => self
                    .local
                    .broadcast_to_all_local(&OutboundEvent::CountUpdated(update)),
                Err(e) => {
                    log::warn!("Ignoring delivery on {channel}: {e}");
                    0
                }
            },
            NEW_MESSAGE_CHANNEL => {
                let message = ChatMessage::stamped(payload, self.config.origin_port);
                self.local
                    .broadcast_to_all_local(&OutboundEvent::NewMessage(message))
            }
            other => {
                log::debug!("Ignoring delivery on unexpected channel {other}");
                0
            }
        }
    }

    /// Refuse further counter updates and return this instance's share of
    /// the shared counter. Waits for in-flight counter updates first.
    pub async fn seal(&self) -> usize {
        let mut sealed = self.sealed.write().await;
        *sealed = true;
        self.tracker.local_open()
    }

    pub async fn is_sealed(&self) -> bool {
        *self.sealed.read().await
    }

    pub fn local_open(&self) -> usize {
        self.tracker.local_open()
    }

    pub fn counter(&self) -> &Arc<dyn SharedCounter> {
        &self.counter
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    async fn announce(&self, count: i64) -> Result<()> {
        let payload = CountUpdate { count }.to_payload();
        self.backbone
            .publish(CONNECTION_COUNT_UPDATED_CHANNEL, &payload)
            .await
            .map(|_| ())
            .map_err(|source| RelayError::Publish {
                channel: CONNECTION_COUNT_UPDATED_CHANNEL,
                source,
            })
    }
}

#[async_trait]
impl ConnectionEvents for Relay {
    async fn on_connect(&self, id: ConnectionId) -> Result<OpenConnection, ConnectError> {
        let count = {
            let sealed = self.sealed.read().await;
            if *sealed {
                return Err(ConnectError::Rejected(RelayError::Closing));
            }
            let count = self
                .counter
                .increment()
                .await
                .map_err(|e| ConnectError::Rejected(RelayError::Counter(e)))?;
            self.tracker.opened();
            count
        };

        let connection = OpenConnection {
            id,
            count_at_open: count,
        };
        // Publish exactly the value INCR returned; a re-read could be stale.
        match self.announce(count).await {
            Ok(()) => Ok(connection),
            Err(source) => Err(ConnectError::Unannounced { connection, source }),
        }
    }

    async fn on_inbound_chat(&self, connection: &OpenConnection, chat: InboundChat) -> Result<bool> {
        let Some(text) = chat.text() else {
            return Ok(false);
        };

        self.backbone
            .publish(NEW_MESSAGE_CHANNEL, &text)
            .await
            .map_err(|source| RelayError::Publish {
                channel: NEW_MESSAGE_CHANNEL,
                source,
            })?;
        log::trace!("Connection {} published a message", connection.id);
        Ok(true)
    }

    async fn on_disconnect(&self, connection: OpenConnection) -> Result<i64> {
        let count = {
            let sealed = self.sealed.read().await;
            if *sealed {
                // Already accounted for by the shutdown reconciliation.
                return Err(RelayError::Closing);
            }
            let count = self.counter.decrement().await.map_err(RelayError::Counter)?;
            self.tracker.closed();
            count
        };

        log::trace!("Connection {} closed at count {count}", connection.id);
        self.announce(count).await?;
        Ok(count)
    }
}

/// Background tasks draining the fan-out subscriptions.
///
/// Dropping the handle stops fan-out.
#[derive(Default)]
pub struct FanoutTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
    failures: Vec<BackboneError>,
}

impl FanoutTasks {
    fn spawn(&mut self, channel: &'static str, relay: Arc<Relay>, mut subscription: Subscription) {
        let handle = tokio::spawn(async move {
            while let Some(payload) = subscription.recv().await {
                relay.handle_delivery(channel, &payload);
            }
            log::warn!("Subscription to {channel} ended");
        });
        self.handles.push((channel, handle));
    }

    /// Channels with a live fan-out task.
    pub fn subscribed(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(channel, _)| *channel).collect()
    }

    /// Subscriptions that failed at startup.
    pub fn failures(&self) -> &[BackboneError] {
        &self.failures
    }

    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

impl Drop for FanoutTasks {
    fn drop(&mut self) {
        for (_, handle) in &self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackbone;
    use crate::protocol::CONNECTION_COUNT_KEY;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingFanout {
        events: Mutex<Vec<OutboundEvent>>,
    }

    impl RecordingFanout {
        fn events(&self) -> Vec<OutboundEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl LocalFanout for RecordingFanout {
        fn broadcast_to_all_local(&self, event: &OutboundEvent) -> usize {
            self.events.lock().unwrap().push(event.clone());
            1
        }
    }

    /// Backbone that refuses to subscribe one channel.
    struct RefuseChannel {
        inner: MemoryBackbone,
        refused: &'static str,
    }

    #[async_trait]
    impl PubSubBackbone for RefuseChannel {
        async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BackboneError> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<Subscription, BackboneError> {
            if channel == self.refused {
                return Err(BackboneError::Subscribe {
                    channel: channel.to_string(),
                    reason: "refused".into(),
                });
            }
            self.inner.subscribe(channel).await
        }
    }

    fn relay_with(backbone: &MemoryBackbone, port: u16) -> (Arc<Relay>, Arc<RecordingFanout>) {
        let fanout = Arc::new(RecordingFanout::default());
        let config = RelayConfig {
            origin_port: port,
            ..RelayConfig::default()
        };
        let relay = Relay::new(
            config,
            Arc::new(backbone.counter(CONNECTION_COUNT_KEY)),
            Arc::new(backbone.clone()),
            fanout.clone(),
        );
        (Arc::new(relay), fanout)
    }

    #[tokio::test]
    async fn test_connect_publishes_incremented_value() {
        let backbone = MemoryBackbone::new();
        backbone.set_value(CONNECTION_COUNT_KEY, 4);
        let (relay, _) = relay_with(&backbone, 1);

        let conn = relay.on_connect(ConnectionId::new()).await.unwrap();

        assert_eq!(conn.count_at_open(), 5);
        assert_eq!(relay.local_open(), 1);
        assert_eq!(backbone.published_on(CONNECTION_COUNT_UPDATED_CHANNEL), ["5"]);
    }

    #[tokio::test]
    async fn test_failed_increment_records_nothing() {
        let backbone = MemoryBackbone::new();
        let (relay, _) = relay_with(&backbone, 1);
        backbone.set_available(false);

        let result = relay.on_connect(ConnectionId::new()).await;

        assert!(matches!(result, Err(ConnectError::Rejected(RelayError::Counter(_)))));
        assert_eq!(relay.local_open(), 0);
        assert!(backbone.published().is_empty());
    }

    #[tokio::test]
    async fn test_unannounced_connect_still_pairs() {
        struct PublishDown(MemoryBackbone);

        #[async_trait]
        impl PubSubBackbone for PublishDown {
            async fn publish(&self, _: &str, _: &str) -> Result<usize, BackboneError> {
                Err(BackboneError::Unavailable("publisher down".into()))
            }
            async fn subscribe(&self, channel: &str) -> Result<Subscription, BackboneError> {
                self.0.subscribe(channel).await
            }
        }

        let backbone = MemoryBackbone::new();
        let relay = Relay::new(
            RelayConfig::default(),
            Arc::new(backbone.counter(CONNECTION_COUNT_KEY)),
            Arc::new(PublishDown(backbone.clone())),
            Arc::new(RecordingFanout::default()),
        );

        let conn = match relay.on_connect(ConnectionId::new()).await {
            Err(ConnectError::Unannounced { connection, source }) => {
                assert!(matches!(source, RelayError::Publish { .. }));
                connection
            }
            other => panic!("expected Unannounced, got {other:?}"),
        };
        assert_eq!(backbone.value(CONNECTION_COUNT_KEY), Some(1));
        assert_eq!(relay.local_open(), 1);

        // Decrement still happens; only the announcement fails.
        assert!(relay.on_disconnect(conn).await.is_err());
        assert_eq!(backbone.value(CONNECTION_COUNT_KEY), Some(0));
        assert_eq!(relay.local_open(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_publishes_decremented_value() {
        let backbone = MemoryBackbone::new();
        let (relay, _) = relay_with(&backbone, 1);

        let a = relay.on_connect(ConnectionId::new()).await.unwrap();
        let b = relay.on_connect(ConnectionId::new()).await.unwrap();
        assert_eq!(relay.on_disconnect(a).await.unwrap(), 1);
        assert_eq!(relay.on_disconnect(b).await.unwrap(), 0);

        assert_eq!(
            backbone.published_on(CONNECTION_COUNT_UPDATED_CHANNEL),
            ["1", "2", "1", "0"]
        );
        assert_eq!(relay.local_open(), 0);
    }

    #[tokio::test]
    async fn test_failed_decrement_keeps_local_share() {
        let backbone = MemoryBackbone::new();
        let (relay, _) = relay_with(&backbone, 1);
        let conn = relay.on_connect(ConnectionId::new()).await.unwrap();

        backbone.set_available(false);
        assert!(matches!(relay.on_disconnect(conn).await, Err(RelayError::Counter(_))));
        assert_eq!(relay.local_open(), 1);
    }

    #[tokio::test]
    async fn test_inbound_chat_publishes_text_only() {
        let backbone = MemoryBackbone::new();
        let (relay, fanout) = relay_with(&backbone, 1);
        let conn = relay.on_connect(ConnectionId::new()).await.unwrap();

        assert!(relay.on_inbound_chat(&conn, InboundChat::new("hello")).await.unwrap());
        assert!(!relay.on_inbound_chat(&conn, InboundChat::default()).await.unwrap());

        assert_eq!(backbone.published_on(NEW_MESSAGE_CHANNEL), ["hello"]);
        // No local echo without a backbone delivery.
        assert!(fanout.events().is_empty());
    }

    #[tokio::test]
    async fn test_handle_delivery_count() {
        let backbone = MemoryBackbone::new();
        let (relay, fanout) = relay_with(&backbone, 1);

        assert_eq!(relay.handle_delivery(CONNECTION_COUNT_UPDATED_CHANNEL, "12"), 1);
        assert_eq!(relay.handle_delivery(CONNECTION_COUNT_UPDATED_CHANNEL, "twelve"), 0);
        assert_eq!(relay.handle_delivery("chat:other", "x"), 0);

        assert_eq!(fanout.events(), [OutboundEvent::CountUpdated(CountUpdate { count: 12 })]);
    }

    #[tokio::test]
    async fn test_handle_delivery_message_is_stamped_locally() {
        let backbone = MemoryBackbone::new();
        let (relay, fanout) = relay_with(&backbone, 4242);

        relay.handle_delivery(NEW_MESSAGE_CHANNEL, "hey");
        relay.handle_delivery(NEW_MESSAGE_CHANNEL, "hey");

        let events = fanout.events();
        let stamped: Vec<&ChatMessage> = events
            .iter()
            .map(|e| match e {
                OutboundEvent::NewMessage(m) => m,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(stamped.len(), 2);
        assert!(stamped.iter().all(|m| m.message == "hey" && m.origin_port == 4242));
        assert_ne!(stamped[0].id, stamped[1].id);
    }

    #[tokio::test]
    async fn test_sealed_relay_refuses_counter_updates() {
        let backbone = MemoryBackbone::new();
        let (relay, _) = relay_with(&backbone, 1);
        let conn = relay.on_connect(ConnectionId::new()).await.unwrap();

        assert_eq!(relay.seal().await, 1);
        assert!(relay.is_sealed().await);

        assert!(matches!(
            relay.on_connect(ConnectionId::new()).await,
            Err(ConnectError::Rejected(RelayError::Closing))
        ));
        assert!(matches!(relay.on_disconnect(conn).await, Err(RelayError::Closing)));
        assert_eq!(backbone.value(CONNECTION_COUNT_KEY), Some(1));
    }

    #[tokio::test]
    async fn test_start_initializes_counter_and_fans_out() {
        let backbone = MemoryBackbone::new();
        let (relay, fanout) = relay_with(&backbone, 1);

        let tasks = relay.start().await.unwrap();
        assert_eq!(backbone.value(CONNECTION_COUNT_KEY), Some(0));
        assert_eq!(tasks.subscribed(), FANOUT_CHANNELS);
        assert!(!tasks.is_degraded());

        backbone.publish(NEW_MESSAGE_CHANNEL, "via backbone").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while fanout.events().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_degraded_on_single_subscription_failure() {
        let backbone = MemoryBackbone::new();
        let relay = Arc::new(Relay::new(
            RelayConfig::default(),
            Arc::new(backbone.counter(CONNECTION_COUNT_KEY)),
            Arc::new(RefuseChannel {
                inner: backbone.clone(),
                refused: NEW_MESSAGE_CHANNEL,
            }),
            Arc::new(RecordingFanout::default()),
        ));

        let tasks = relay.start().await.unwrap();
        assert_eq!(tasks.subscribed(), [CONNECTION_COUNT_UPDATED_CHANNEL]);
        assert!(tasks.is_degraded());
        assert!(matches!(
            &tasks.failures()[0],
            BackboneError::Subscribe { channel, .. } if channel == NEW_MESSAGE_CHANNEL
        ));
    }

    #[tokio::test]
    async fn test_start_fails_when_no_channel_subscribes() {
        struct RefuseAll(MemoryBackbone);

        #[async_trait]
        impl PubSubBackbone for RefuseAll {
            async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BackboneError> {
                self.0.publish(channel, payload).await
            }

            async fn subscribe(&self, channel: &str) -> Result<Subscription, BackboneError> {
                Err(BackboneError::Subscribe {
                    channel: channel.to_string(),
                    reason: "refused".into(),
                })
            }
        }

        let backbone = MemoryBackbone::new();
        let relay = Arc::new(Relay::new(
            RelayConfig::default(),
            Arc::new(backbone.counter(CONNECTION_COUNT_KEY)),
            Arc::new(RefuseAll(backbone.clone())),
            Arc::new(RecordingFanout::default()),
        ));

        match relay.start().await {
            Err(RelayError::Unsubscribed(failures)) => assert_eq!(failures.len(), 2),
            other => panic!("expected Unsubscribed, got {:?}", other.map(|t| t.subscribed())),
        }
        // The counter was still initialized before subscribing.
        assert_eq!(backbone.value(CONNECTION_COUNT_KEY), Some(0));
    }

    #[tokio::test]
    async fn test_start_fails_without_backbone() {
        let backbone = MemoryBackbone::new();
        let (relay, _) = relay_with(&backbone, 1);
        backbone.set_available(false);

        assert!(matches!(relay.start().await, Err(RelayError::Counter(_))));
    }
}
