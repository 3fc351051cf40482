//! # chorus-server: network edge of the chat relay
//!
//! Serves WebSocket chat clients on one port, backs the shared connection
//! count and message fan-out with Redis, and answers health checks on the
//! same listener.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket (JSON)   ┌─────────────┐
//! │ browser     │ ◄──────────────────► │ RelayServer │
//! └─────────────┘                      └──────┬──────┘
//!                                             │
//!                                      ┌──────┴──────┐      ┌───────────┐
//!                                      │ Relay       │ ◄──► │ Redis     │
//!                                      │ (core)      │      │ key + 2ch │
//!                                      └─────────────┘      └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: environment configuration
//! - [`redis_backbone`]: Redis counter and pub/sub
//! - [`server`]: axum router, WebSocket handling and `GET /healthcheck`
//! - [`error`]: process-level errors

pub mod config;
pub mod error;
pub mod redis_backbone;
pub mod server;

pub use config::{ConfigError, ServerConfig, BACKBONE_URL_VAR};
pub use error::ServerError;
pub use redis_backbone::{RedisBackbone, RedisCounter};
pub use server::{RelayServer, ServerStats, HEALTHCHECK_PATH};

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => log::info!("Received Ctrl-C"),
        () = terminate => log::info!("Received SIGTERM"),
    }
}
