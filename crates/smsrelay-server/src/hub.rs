//! Broadcast hub: owns the connection registry, reacts to socket lifecycle
//! events, and fans incoming SMS events out to every live subscriber.
//!
//! The WebSocket endpoint itself also lives here. [`start`] binds the event
//! port and serves `/` as an upgrade endpoint; each accepted socket is driven
//! by a writer/reader task pair wired back into the hub callbacks.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use smsrelay_core::{
    ConnectionError, FaultKind, GREETING, LISTENING_REPLY, SmsEnvelope, StartError,
};

use crate::config::RelayConfig;
use crate::connection::RelayConnection;
use crate::registry::ConnectionRegistry;

/// Keepalive cadence on otherwise idle sockets.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared fan-out core. One instance outlives any number of server
/// start/stop cycles; the registry empties on stop but the hub itself is
/// never recreated.
#[derive(Debug)]
pub struct BroadcastHub {
    registry: ConnectionRegistry,
    queue_capacity: usize,
}

impl BroadcastHub {
    /// Hub whose per-subscriber outbound queues hold `queue_capacity`
    /// messages before the subscriber is considered dead.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            queue_capacity,
        }
    }

    /// Number of currently tracked subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Register a freshly opened connection and greet it. A failed greeting
    /// is logged and never propagated; the subscriber stays registered until
    /// its socket actually reports closure.
    pub fn on_connection_opened(&self, conn: &Arc<RelayConnection>) {
        self.registry.insert(Arc::clone(conn));
        if !conn.send(GREETING.to_string()) {
            warn!(peer = %conn.key(), "greeting not delivered");
        }
        info!(peer = %conn.key(), total = self.registry.len(), "subscriber connected");
    }

    /// Handle a text frame from a subscriber. The relay is one-directional,
    /// so every inbound message gets the same fixed acknowledgement.
    pub fn on_inbound_message(&self, conn: &Arc<RelayConnection>, text: &str) {
        debug!(peer = %conn.key(), len = text.len(), "text from subscriber");
        if let Err(err) = SmsEnvelope::from_json(text) {
            let err = ConnectionError::ProtocolDecode(err);
            debug!(peer = %conn.key(), error = %err, "inbound text is not an sms envelope");
        }
        let _ = conn.send(LISTENING_REPLY.to_string());
    }

    /// Remove a connection by key after its socket closed. Safe to call more
    /// than once per key; only an actual removal is logged.
    pub fn on_connection_closed(&self, key: &str, reason: &str) {
        if self.registry.remove(key).is_some() {
            info!(peer = %key, reason, total = self.registry.len(), "subscriber disconnected");
        }
    }

    /// Classify a socket error, then drop the connection by handle identity
    /// since the key may no longer be derivable from a broken socket.
    pub fn on_connection_error(&self, conn: &Arc<RelayConnection>, err: &(dyn Error + 'static)) {
        let kind = FaultKind::classify(err);
        error!(peer = %conn.key(), fault = kind.as_str(), error = %err, "connection error");
        conn.mark_closed();
        if let Some(key) = self.registry.remove_value(conn) {
            debug!(peer = %key, "removed errored connection");
        }
    }

    /// Deliver one envelope to every live subscriber and report how many
    /// received it. Dead or unwritable connections found along the way are
    /// pruned from the registry; one bad subscriber never affects the rest.
    pub fn broadcast(&self, envelope: &SmsEnvelope) -> usize {
        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "failed to encode sms envelope");
                return 0;
            }
        };

        let mut delivered = 0_usize;
        let mut pruned = 0_usize;
        for conn in self.registry.snapshot() {
            if conn.is_open() && conn.send(payload.clone()) {
                delivered += 1;
            } else if let Some(key) = self.registry.remove_value(&conn) {
                pruned += 1;
                info!(peer = %key, "removed closed connection");
            }
        }

        metrics::counter!("smsrelay_deliveries_total").increment(delivered as u64);
        if pruned > 0 {
            metrics::counter!("smsrelay_pruned_total").increment(pruned as u64);
        }
        delivered
    }

    /// Wrap a received SMS in the wire envelope and broadcast it.
    pub fn ingest(&self, sender: &str, message: &str, timestamp: i64) -> usize {
        let envelope = SmsEnvelope::new(sender, message, timestamp);
        let delivered = self.broadcast(&envelope);
        info!(sender, delivered, "relayed sms to subscribers");
        delivered
    }

    /// Drop every subscriber, marking their handles closed first.
    pub fn disconnect_all(&self) {
        self.registry.clear();
    }
}

#[derive(Clone)]
struct WsState {
    hub: Arc<BroadcastHub>,
    shutdown: CancellationToken,
}

fn router(state: WsState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| drive_socket(socket, peer, state))
}

/// Run one subscriber socket to completion. The writer half drains the
/// outbound queue and keeps the socket alive with pings; the reader half
/// feeds frames into the hub callbacks. Whichever side finishes first ends
/// the connection.
async fn drive_socket(socket: WebSocket, peer: SocketAddr, state: WsState) {
    let key = peer.to_string();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(state.hub.queue_capacity);
    let conn = Arc::new(RelayConnection::new(key.clone(), outbound_tx));
    state.hub.on_connection_opened(&conn);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let token = state.shutdown.clone();

    let writer_token = token.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                maybe = outbound_rx.recv() => {
                    let Some(text) = maybe else { break };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = writer_token.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let reader_hub = Arc::clone(&state.hub);
    let reader_conn = Arc::clone(&conn);
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    reader_hub.on_inbound_message(&reader_conn, text.as_str());
                }
                Ok(Message::Close(frame)) => {
                    debug!(peer = %reader_conn.key(), ?frame, "close frame received");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    reader_hub.on_connection_error(&reader_conn, &err);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => {}
        _ = &mut reader => {}
    }
    writer.abort();
    reader.abort();

    let reason = if token.is_cancelled() {
        "server shutdown"
    } else {
        "connection closed"
    };
    state.hub.on_connection_closed(&key, reason);
}

/// Running WebSocket endpoint. Dropping the handle leaks the task; call
/// [`HubHandle::shutdown`] to stop it.
#[derive(Debug)]
pub struct HubHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl HubHandle {
    /// Address the endpoint actually bound, with the resolved port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancel the accept loop and wait up to `grace` for in-flight
    /// connections to drain before aborting the serve task.
    pub async fn shutdown(mut self, grace: Duration) {
        self.shutdown.cancel();
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "websocket hub task failed"),
            Err(_) => {
                warn!("websocket hub did not stop within grace period, aborting");
                self.task.abort();
            }
        }
    }
}

/// Bind the event port and start serving WebSocket upgrades on `/`.
///
/// Bind failures are classified into [`StartError`] so callers can tell an
/// occupied port from a permission problem.
pub async fn start(hub: Arc<BroadcastHub>, config: &RelayConfig) -> Result<HubHandle, StartError> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| StartError::from_bind(config.port, err))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| StartError::from_bind(config.port, err))?;

    let shutdown = CancellationToken::new();
    let state = WsState {
        hub,
        shutdown: shutdown.clone(),
    };
    let app = router(state);

    let serve_token = shutdown.clone();
    let task = tokio::spawn(async move {
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(serve_token.cancelled_owned());
        if let Err(err) = serve.await {
            error!(error = %err, "websocket hub exited with error");
        }
    });

    info!(addr = %local_addr, "websocket hub listening");
    Ok(HubHandle {
        local_addr,
        shutdown,
        task,
    })
}
