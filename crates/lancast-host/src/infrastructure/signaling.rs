//! WebSocket signaling front end: accept loop and per-connection tasks.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting incoming TCP connections from viewers.
//! 3. Upgrading each connection to a WebSocket session.
//! 4. Running two tasks per connection:
//!    - **reader**: parses inbound JSON frames into [`ClientMessage`]s and
//!      feeds them to the coordinator, preserving per-viewer order,
//!    - **writer**: drains the connection's outbound queue into JSON text
//!      frames, then closes the socket with a normal closure once the
//!      coordinator drops the queue.
//! 5. Shutting down the accept loop when the `running` flag is cleared.
//!
//! One bad frame never kills a connection: parse failures are logged and the
//! frame is dropped, because a viewer with a newer protocol revision may
//! still speak every message we actually care about.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async,
    tungstenite::protocol::frame::coding::CloseCode,
    tungstenite::protocol::CloseFrame,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};

use lancast_core::protocol::messages::{ClientMessage, ServerMessage};

use crate::application::coordinator::{
    ConnectionEvent, CoordinatorConfig, CoordinatorHandle, SessionCoordinator, SessionEvent,
};

/// Error type for the signaling front end.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// The listener could not be bound (port in use, missing permission).
    /// Fatal to startup; there is no silent retry.
    #[error("failed to bind signaling listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// A running signaling server: listener, accept loop, and the coordinator it
/// feeds.
pub struct SignalingServer {
    local_addr: SocketAddr,
    coordinator: CoordinatorHandle,
    running: Arc<AtomicBool>,
    accept_task: JoinHandle<()>,
}

impl SignalingServer {
    /// Binds the listener, spawns the coordinator and the accept loop.
    ///
    /// Returns the server plus the coordinator's session event stream.
    /// Binding port 0 picks a free port; see [`Self::local_addr`].
    ///
    /// # Errors
    ///
    /// [`SignalingError::Bind`] when the listener cannot be bound.
    pub async fn start(
        config: CoordinatorConfig,
        bind_addr: SocketAddr,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), SignalingError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| SignalingError::Bind { addr: bind_addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| SignalingError::Bind { addr: bind_addr, source })?;
        info!("signaling listening on {local_addr}");

        let (coordinator, events) = SessionCoordinator::spawn(config);
        let running = Arc::new(AtomicBool::new(true));
        let accept_task = tokio::spawn(run_accept_loop(
            listener,
            coordinator.clone(),
            Arc::clone(&running),
        ));

        Ok((
            Self {
                local_addr,
                coordinator,
                running,
                accept_task,
            },
            events,
        ))
    }

    /// The address the listener actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle to the coordinator, for kicks, broadcasts, and roster reads.
    pub fn coordinator(&self) -> CoordinatorHandle {
        self.coordinator.clone()
    }

    /// Stops accepting, shuts down the coordinator, and closes every viewer
    /// connection with a normal closure.  Idempotent.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.accept_task.abort();
        self.coordinator.stop().await;
        info!("signaling stopped");
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn run_accept_loop(
    listener: TcpListener,
    coordinator: CoordinatorHandle,
    running: Arc<AtomicBool>,
) {
    let next_conn_id = AtomicU64::new(1);
    loop {
        if !running.load(Ordering::Relaxed) {
            debug!("shutdown flag set; stopping accept loop");
            break;
        }

        // Short timeout so the loop can re-check the running flag even when
        // no viewers are connecting.
        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                info!("viewer connection from {peer_addr}");
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    handle_viewer_connection(stream, peer_addr, conn_id, coordinator).await;
                });
            }
            Ok(Err(e)) => {
                // Transient accept error (e.g. fd exhaustion); keep serving.
                error!("accept error: {e}");
            }
            Err(_) => {
                // Timeout; loop back to the flag check.
            }
        }
    }
}

// ── Per-connection handling ───────────────────────────────────────────────────

/// Outer wrapper for one connection: logs the outcome and guarantees the
/// coordinator sees a close event exactly once the reader is done.
async fn handle_viewer_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    conn_id: u64,
    coordinator: CoordinatorHandle,
) {
    match run_connection(stream, peer_addr, conn_id, &coordinator).await {
        Ok(()) => info!("connection {peer_addr} closed"),
        Err(e) => warn!("connection {peer_addr} closed with error: {e:#}"),
    }
    coordinator
        .connection_event(ConnectionEvent::Closed { conn_id })
        .await;
}

/// Runs one connection's lifecycle: handshake, registration, writer task,
/// reader loop.
async fn run_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    conn_id: u64,
    coordinator: &CoordinatorHandle,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // The coordinator owns the sender; dropping it (kick, supersede,
    // shutdown) is the signal to flush and close normally.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    coordinator
        .connection_event(ConnectionEvent::Opened {
            conn_id,
            outbound: out_tx,
        })
        .await;

    // Writer task: outbound queue → JSON text frames → close frame.
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!("connection {conn_id}: serialization error: {e}");
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                debug!("connection {conn_id}: send failed (viewer disconnected)");
                return;
            }
        }
        // Queue dropped by the coordinator: say goodbye properly.
        let _ = ws_tx
            .send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await;
    });

    // Reader loop: JSON text frames → ClientMessage → coordinator.
    loop {
        let frame = match ws_rx.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) => {
                debug!("connection {conn_id}: closed by peer");
                break;
            }
            Some(Err(e)) => {
                warn!("connection {conn_id}: WebSocket error: {e}");
                break;
            }
            None => break,
        };

        match frame {
            WsMessage::Text(text) => {
                let message: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        // Unknown or malformed control message; the
                        // connection stays up.
                        warn!("connection {conn_id}: unparseable message dropped: {e}");
                        continue;
                    }
                };
                coordinator
                    .connection_event(ConnectionEvent::Inbound { conn_id, message })
                    .await;
            }
            WsMessage::Binary(_) => {
                warn!("connection {conn_id}: unexpected binary frame (ignored)");
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => {
                // Protocol-level keepalive; tokio-tungstenite answers pings
                // on the sink automatically.
            }
            WsMessage::Close(_) => {
                debug!("connection {conn_id}: close frame received");
                break;
            }
            WsMessage::Frame(_) => {}
        }
    }

    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            presenter_id: "p-1".to_string(),
            presenter_name: "Dr. Lee".to_string(),
            room_name: "Lab".to_string(),
            ..CoordinatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_on_port_zero_reports_real_port() {
        // Arrange / Act
        let result = SignalingServer::start(test_config(), "127.0.0.1:0".parse().unwrap()).await;

        // Assert
        let (server, _events) = assert_ok!(result);
        assert_ne!(server.local_addr().port(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_surfaces_as_bind_error() {
        // Arrange: occupy a port
        let (first, _events) =
            SignalingServer::start(test_config(), "127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
        let taken = first.local_addr();

        // Act
        let result = SignalingServer::start(test_config(), taken).await;

        // Assert: the failure is typed and names the address
        match result {
            Err(SignalingError::Bind { addr, .. }) => assert_eq!(addr, taken),
            Ok(_) => panic!("second bind on {taken} must fail"),
        }
        first.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (server, _events) =
            SignalingServer::start(test_config(), "127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
        server.stop().await;
        server.stop().await;
    }
}
