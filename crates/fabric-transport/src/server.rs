//! WebSocket transport server using Axum.
//!
//! Upgrades `/ws` requests into hub connections and pumps packets between
//! the socket and the [`Connection`] handle. Callers may merge extra routes
//! (the admin API, for instance) into the same listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use fabric_protocol::{EventPacket, Events};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::connection::Outbound;
use crate::error::TransportError;
use crate::hub::Hub;

/// Transport server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Enable permissive CORS
    pub enable_cors: bool,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Log every inbound packet
    pub verbose_logging: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 7070,
            hostname: "127.0.0.1".into(),
            enable_cors: false,
            max_connections: Some(32),
            verbose_logging: false,
        }
    }
}

struct AppState {
    hub: Hub,
    config: TransportConfig,
    client_count: Arc<AtomicUsize>,
}

/// The HTTP listener. Dropping it without [`TransportServer::stop`] leaves
/// the serve task running until the runtime shuts down.
pub struct TransportServer {
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
    addr: SocketAddr,
}

impl TransportServer {
    /// Bind and start serving. `extra` is merged next to `/ws` and `/health`.
    pub async fn start(
        config: TransportConfig,
        hub: Hub,
        extra: Router,
    ) -> Result<Self, TransportError> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let state = Arc::new(AppState {
            hub,
            config: config.clone(),
            client_count: Arc::new(AtomicUsize::new(0)),
        });

        let mut app = Router::new()
            .route("/ws", get(ws_upgrade_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .merge(extra);
        if config.enable_cors {
            app = app.layer(CorsLayer::permissive());
        }

        let listener = tokio::net::TcpListener::bind((config.hostname.as_str(), config.port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => {
                    TransportError::AddressInUse(format!("{}:{}", config.hostname, config.port))
                }
                _ => TransportError::Io(e),
            })?;
        let addr = listener.local_addr()?;

        info!("Fabric transport listening on ws://{}:{}/ws", config.hostname, addr.port());

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
            {
                error!("Transport server error: {e}");
            }
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            addr,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Gracefully stop the server.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Fabric transport server stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if let Some(max) = state.config.max_connections {
        let current = state.client_count.load(Ordering::Relaxed);
        if current >= max {
            warn!("Connection rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.client_count.load(Ordering::Relaxed),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    state.client_count.fetch_add(1, Ordering::Relaxed);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (connection, mut outbound_rx) = state.hub.accept();
    let client_id = connection.id().to_string();
    info!("Client connected: {client_id}");

    let welcome = EventPacket::new(
        Events::CONNECTED,
        vec![json!({ "clientId": client_id, "namespace": connection.namespace() })],
    );
    match welcome.to_text() {
        Ok(text) => {
            if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                error!("Failed to send welcome to {client_id}: {e}");
            }
        }
        Err(e) => error!("Failed to encode welcome: {e}"),
    }

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if state.config.verbose_logging {
                            debug!("Inbound from {client_id}: {}", text.as_str());
                        }
                        match EventPacket::parse(text.as_str()) {
                            Ok(packet) => {
                                connection.dispatch(&packet);
                            }
                            Err(e) => debug!("Dropped malformed packet from {client_id}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client closed socket: {client_id}");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {client_id}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            error!("Failed to send to {client_id}: {e}");
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    connection.disconnect();
    state.client_count.fetch_sub(1, Ordering::Relaxed);
    info!(
        "Client disconnected: {client_id} (total: {})",
        state.client_count.load(Ordering::Relaxed)
    );
}
