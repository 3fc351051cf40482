//! # chorus-core: cross-instance connection count and message fan-out
//!
//! Keeps a per-process connection count consistent with a counter shared by
//! every relay instance, and fans chat messages and count updates out to all
//! local connections of every instance.
//!
//! ## Architecture
//!
//! ```text
//!   instance A                                   instance B
//! ┌──────────────┐        ┌────────────────┐   ┌──────────────┐
//! │ Relay        │ INCR/  │ backbone       │   │ Relay        │
//! │  tracker     │ DECR ─►│  counter key   │◄──│  tracker     │
//! │              │ PUB  ─►│  count channel │──►│              │
//! │              │◄───────│  message chan. │──►│              │
//! └──────┬───────┘        └────────────────┘   └──────┬───────┘
//!        ▼                                            ▼
//!  LocalBroadcast                               LocalBroadcast
//!  (A's sockets)                                (B's sockets)
//! ```
//!
//! ## Modules
//!
//! - [`counter`]: shared atomic counter trait
//! - [`backbone`]: pub/sub trait and subscriptions
//! - [`memory`]: in-process backbone for tests and single-node use (bounded publish log)
//! - [`tracker`]: this instance's share of the counter
//! - [`broadcast`]: fan-out to local connections
//! - [`relay`]: lifecycle state machine and delivery fan-out
//! - [`reconcile`]: bounded shutdown adjustment
//! - [`protocol`]: backbone names and client event frames

pub mod backbone;
pub mod broadcast;
pub mod counter;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod reconcile;
pub mod relay;
pub mod tracker;

pub use backbone::{PubSubBackbone, Subscription};
pub use broadcast::{BroadcastStats, Frame, LocalBroadcast, LocalConnection, LocalFanout};
pub use counter::SharedCounter;
pub use error::{BackboneError, ConnectError, RelayError};
pub use memory::{MemoryBackbone, MemoryCounter, PUBLISH_LOG_CAPACITY};
pub use protocol::{
    ChatMessage, ClientFrame, CountUpdate, InboundChat, OutboundEvent, ProtocolError,
    CONNECTION_COUNT_KEY, CONNECTION_COUNT_UPDATED_CHANNEL, FANOUT_CHANNELS, NEW_MESSAGE_CHANNEL,
};
pub use reconcile::{ReconcileOutcome, ShutdownReconciler};
pub use relay::{ConnectionEvents, ConnectionId, FanoutTasks, OpenConnection, Relay, RelayConfig};
pub use tracker::ConnectionTracker;
