//! Shutdown reconciliation.
//!
//! Connections still open when the process stops never run their own
//! decrement. One bounded pass subtracts this instance's share from the
//! shared counter instead, clamped at zero. If the backbone is unreachable
//! the counter drifts until corrected externally; the pass is never retried.

use std::time::Duration;

use crate::error::BackboneError;
use crate::relay::Relay;

/// Result of the reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No local connections were open.
    Skipped,
    /// `released` connections were subtracted; `count` is the stored value.
    Adjusted { released: usize, count: i64 },
    /// The backbone rejected the adjustment.
    Failed(BackboneError),
    /// The grace deadline passed first.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ShutdownReconciler {
    grace: Duration,
}

impl ShutdownReconciler {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Use the grace period from the relay's configuration.
    pub fn for_relay(relay: &Relay) -> Self {
        Self::new(relay.config().shutdown_grace)
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Seal `relay` and remove its share of the shared counter.
    pub async fn run(&self, relay: &Relay) -> ReconcileOutcome {
        let outcome = tokio::time::timeout(self.grace, Self::reconcile(relay))
            .await
            .unwrap_or(ReconcileOutcome::TimedOut);

        match &outcome {
            ReconcileOutcome::Skipped => log::debug!("No local connections to reconcile"),
            ReconcileOutcome::Adjusted { released, count } => {
                log::info!("Released {released} local connections, shared count now {count}")
            }
            ReconcileOutcome::Failed(e) => {
                log::error!("Connection count reconciliation failed, count will drift: {e}")
            }
            ReconcileOutcome::TimedOut => log::error!(
                "Connection count reconciliation exceeded {:?}, count will drift",
                self.grace
            ),
        }
        outcome
    }

    async fn reconcile(relay: &Relay) -> ReconcileOutcome {
        let local_open = relay.seal().await;
        if local_open == 0 {
            return ReconcileOutcome::Skipped;
        }

        let delta = -i64::try_from(local_open).unwrap_or(i64::MAX);
        match relay.counter().adjust_by(delta).await {
            Ok(count) => ReconcileOutcome::Adjusted {
                released: local_open,
                count,
            },
            Err(e) => ReconcileOutcome::Failed(e),
        }
    }
}
