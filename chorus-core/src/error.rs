//! Error types shared by the relay core and its backbone adapters.

use thiserror::Error;

use crate::relay::OpenConnection;

/// Failure talking to the shared backbone (counter store or pub/sub).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackboneError {
    /// The backbone could not be reached at all.
    #[error("backbone unavailable: {0}")]
    Unavailable(String),

    /// A single command was rejected or failed mid-flight.
    #[error("backbone {op} failed: {reason}")]
    Command { op: &'static str, reason: String },

    /// Subscribing to a channel failed.
    #[error("subscription to {channel} failed: {reason}")]
    Subscribe { channel: String, reason: String },
}

/// Errors surfaced by [`Relay`](crate::relay::Relay) operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A shared counter operation failed.
    #[error("connection counter update failed: {0}")]
    Counter(#[source] BackboneError),

    /// Publishing onto a backbone channel failed.
    #[error("publish on {channel} failed: {source}")]
    Publish {
        channel: &'static str,
        #[source]
        source: BackboneError,
    },

    /// Neither fan-out channel could be subscribed.
    #[error("no fan-out channel could be subscribed ({} failures)", .0.len())]
    Unsubscribed(Vec<BackboneError>),

    /// The relay has been sealed for shutdown.
    #[error("relay is shutting down")]
    Closing,
}

/// Outcome of a connect that did not complete cleanly.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Nothing was recorded: the shared counter never moved.
    #[error("connection rejected: {0}")]
    Rejected(#[source] RelayError),

    /// The counter moved but the new count never reached the backbone.
    ///
    /// The connection is open and must still be passed to
    /// [`on_disconnect`](crate::relay::ConnectionEvents::on_disconnect).
    #[error("connection opened but count not announced: {source}")]
    Unannounced {
        connection: OpenConnection,
        #[source]
        source: RelayError,
    },
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
