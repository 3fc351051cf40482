//! HTTP and WebSocket edge of the relay.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── INCR / DECR / PUBLISH ──► backbone
//!            ├── RelayServer ── Relay ─┤
//! Client B ──┘        ▲                └── subscriptions ◄────────── backbone
//!                     │                          │
//!                     └──── LocalBroadcast ◄─────┘
//! ```
//!
//! Routes:
//! - `GET /` upgrades to a chat socket
//! - `GET /healthcheck` returns `{"status":"ok","port":…}`
//!
//! Each socket registers with the local broadcast group, reports the connect
//! to the relay, then pumps inbound chat frames to the relay and outbound
//! frames to the socket until either side closes or the server shuts down.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chorus_core::{
    ClientFrame, ConnectError, ConnectionEvents, ConnectionId, LocalBroadcast, OpenConnection,
    ReconcileOutcome, Relay, RelayError, ShutdownReconciler,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch, RwLock};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::{ConfigError, ServerConfig};
use crate::error::ServerError;

pub const HEALTHCHECK_PATH: &str = "/healthcheck";

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub inbound_frames: u64,
    pub health_checks: u64,
}

/// State every connection shares.
struct Shared {
    config: ServerConfig,
    relay: Arc<Relay>,
    local: Arc<LocalBroadcast>,
    stats: RwLock<ServerStats>,
}

/// Axum handler state.
#[derive(Clone)]
struct AppState {
    shared: Arc<Shared>,
    /// Flips to `true` once shutdown reconciliation has run.
    closing: watch::Receiver<bool>,
}

/// The relay's network edge.
pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, relay: Arc<Relay>, local: Arc<LocalBroadcast>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                relay,
                local,
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        Ok(TcpListener::bind(self.shared.config.bind_addr()).await?)
    }

    /// Bind and serve until Ctrl-C / SIGTERM, then reconcile.
    pub async fn run(&self) -> Result<ReconcileOutcome, ServerError> {
        let listener = self.bind().await?;
        self.serve_until(listener, crate::shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves.
    ///
    /// Shutdown stops accepting, runs exactly one reconciliation pass bounded
    /// by the configured grace period, then closes every open socket whatever
    /// the outcome.
    pub async fn serve_until<F>(
        &self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<ReconcileOutcome, ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (closing_tx, closing_rx) = watch::channel(false);
        let router = self.router(closing_rx)?;

        let addr = listener.local_addr()?;
        log::info!("Server started at http://{addr}");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        log::info!("Shutting down, reconciling connection count");
        let outcome = ShutdownReconciler::for_relay(&self.shared.relay)
            .run(&self.shared.relay)
            .await;
        let _ = closing_tx.send(true);
        Ok(outcome)
    }

    fn router(&self, closing: watch::Receiver<bool>) -> Result<Router, ServerError> {
        let cors = cors_layer(&self.shared.config.cors_origin)?;
        let state = AppState {
            shared: self.shared.clone(),
            closing,
        };
        Ok(Router::new()
            .route("/", get(ws_handler))
            .route(HEALTHCHECK_PATH, get(health_handler))
            .with_state(state)
            .layer(cors))
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.shared.relay
    }
}

/// CORS policy for the configured origin (`*` allows any).
pub fn cors_layer(origin: &str) -> Result<CorsLayer, ConfigError> {
    let allow_origin = if origin == "*" {
        AllowOrigin::any()
    } else {
        let value = HeaderValue::from_str(origin).map_err(|_| ConfigError::Invalid {
            var: "CORS_ORIGIN",
            value: origin.to_string(),
        })?;
        AllowOrigin::exact(value)
    };
    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::OPTIONS]))
}

/// JSON body of a health check response.
pub fn health_body(port: u16) -> Value {
    json!({ "status": "ok", "port": port })
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    state.shared.stats.write().await.health_checks += 1;
    Json(health_body(state.shared.config.port))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !state.shared.config.allows_origin(origin) {
        log::warn!("Rejected handshake from {addr}: origin {origin:?} not allowed");
        state.shared.stats.write().await.rejected_connections += 1;
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    ws.on_upgrade(move |socket| async move {
        state.shared.handle_socket(socket, addr, state.closing).await;
    })
}

impl Shared {
    /// Handle a single WebSocket connection.
    async fn handle_socket(&self, socket: WebSocket, addr: SocketAddr, mut closing: watch::Receiver<bool>) {
        let (mut ws_sender, mut ws_receiver) = socket.split();

        // Register before connecting so this socket sees its own count update.
        let id = ConnectionId::new();
        let mut outbound = self.local.add_connection(id, Some(addr)).await;

        let connection = match self.relay.on_connect(id).await {
            Ok(connection) => connection,
            Err(ConnectError::Unannounced { connection, source }) => {
                log::error!("Client {addr} connected but count was not published: {source}");
                connection
            }
            Err(ConnectError::Rejected(e)) => {
                self.local.remove_connection(&id).await;
                self.stats.write().await.rejected_connections += 1;
                log::error!("Rejected client {addr}: {e}");
                let _ = ws_sender.send(Message::Close(None)).await;
                return;
            }
        };
        log::info!("Client connected");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Pings are answered by the WebSocket layer itself.
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.stats.write().await.inbound_frames += 1;
                            self.handle_frame(&connection, text.as_str(), addr).await;
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = outbound.recv() => {
                    match frame {
                        Ok(frame) => {
                            if let Err(e) = ws_sender.send(Message::Text(frame.as_ref().into())).await {
                                log::debug!("Send to {addr} failed: {e}");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Client {addr} lagged by {n} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = closing.changed() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        self.local.remove_connection(&id).await;
        log::info!("Client disconnected");
        self.close(connection).await;
    }

    async fn handle_frame(&self, connection: &OpenConnection, text: &str, addr: SocketAddr) {
        match ClientFrame::decode(text) {
            Ok(ClientFrame::Chat(chat)) => {
                if let Err(e) = self.relay.on_inbound_chat(connection, chat).await {
                    log::error!("Message from {addr} was not published: {e}");
                }
            }
            Ok(ClientFrame::Unknown(event)) => {
                log::debug!("Unhandled event {event:?} from {addr}");
            }
            Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
        }
    }

    async fn close(&self, connection: OpenConnection) {
        match self.relay.on_disconnect(connection).await {
            Ok(count) => log::debug!("Connection count now {count}"),
            Err(RelayError::Closing) => log::debug!("Disconnect during shutdown left to reconciliation"),
            Err(e) => log::error!("Disconnect not fully recorded: {e}"),
        }

        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
}
