//! Shared connection counter.
//!
//! A single named integer in the backbone holding the number of open
//! connections across all instances. Only atomic primitives touch it, so
//! concurrent increments from any number of instances never lose updates.

use async_trait::async_trait;

use crate::error::BackboneError;

/// Atomic integer stored in the shared backbone.
///
/// Every method is a network round-trip and therefore a suspension point.
/// Failures are returned as-is; implementations never retry.
#[async_trait]
pub trait SharedCounter: Send + Sync {
    /// Set the counter to 0 if it is absent. Safe to race: two instances
    /// both writing 0 is harmless.
    async fn ensure_initialized(&self) -> Result<(), BackboneError>;

    /// Atomically add 1 and return the resulting value.
    async fn increment(&self) -> Result<i64, BackboneError>;

    /// Atomically subtract 1 and return the resulting value.
    async fn decrement(&self) -> Result<i64, BackboneError>;

    /// Current value; an absent counter reads as 0.
    async fn read(&self) -> Result<i64, BackboneError>;

    /// Atomically add `delta`, clamp the result at 0, store and return it.
    async fn adjust_by(&self, delta: i64) -> Result<i64, BackboneError>;
}
