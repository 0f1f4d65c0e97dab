//! # Agent Connection Handlers
//!
//! Lifecycle of an agent's control connection:
//! - Upgrading the HTTP request to a WebSocket
//! - The auth handshake (first frame must be `auth`, ≤ 10 s)
//! - Registering the resulting [`Tunnel`] and running its loops
//! - Teardown: close, unregister, mark offline
//!
//! The connection has exactly one writer: the outbound task draining the
//! tunnel's frame queue. Everything else sends by queueing.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use burrow_protocol::{decode, encode, Frame, MAX_FRAME_BYTES};

use crate::state::AppState;
use crate::store::RegistryStore;
use crate::tunnel::Tunnel;

/// The agent must complete the auth handshake within this window.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// Server-side heartbeat cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A connection with no inbound frames for this long is considered dead.
const IDLE_DEADLINE: Duration = Duration::from_secs(90);

/// Per-write deadline on the socket.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// `GET /ws` — agents connect here to open their tunnel.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Manages the full lifecycle of one agent connection.
async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // ── Auth handshake ──
    // Nothing else is accepted until an `auth` frame arrives and checks
    // out; the tunnel does not exist yet, so writes here go straight to
    // the sink.
    let device = match tokio::time::timeout(AUTH_DEADLINE, read_auth(&mut ws_stream)).await {
        Ok(Some(token)) => match state.store.lookup_by_token(&token) {
            Some(device) => device,
            None => {
                warn!("agent auth failed: unknown token");
                let _ = send_frame(
                    &mut ws_sink,
                    &Frame::AuthResult {
                        success: false,
                        subdomain: None,
                        message: Some("unknown token".to_string()),
                    },
                )
                .await;
                return;
            }
        },
        Ok(None) => {
            warn!("agent connection dropped before auth");
            return;
        }
        Err(_) => {
            warn!("agent auth timed out");
            let _ = send_frame(
                &mut ws_sink,
                &Frame::AuthResult {
                    success: false,
                    subdomain: None,
                    message: Some("auth timeout".to_string()),
                },
            )
            .await;
            return;
        }
    };

    if send_frame(
        &mut ws_sink,
        &Frame::AuthResult {
            success: true,
            subdomain: Some(device.subdomain.clone()),
            message: None,
        },
    )
    .await
    .is_err()
    {
        return;
    }

    let subdomain = device.subdomain.clone();
    info!(subdomain = %subdomain, "agent authenticated");

    // ── Tunnel setup ──
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let tunnel = Arc::new(Tunnel::new(device, outbound_tx));
    let cancel = tunnel.cancellation();
    state.registry.register(tunnel.clone());

    // ── Outbound Task ──
    // The connection's single writer: drains the queue, serializes, and
    // enforces the per-write deadline.
    let writer_cancel = cancel.clone();
    let outbound_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match encode(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to serialize frame: {e}");
                    continue;
                }
            };
            let write = ws_sink.send(Message::Text(text.into()));
            match tokio::time::timeout(WRITE_DEADLINE, write).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    writer_cancel.cancel();
                    break;
                }
            }
        }
    });

    // ── Ping Task ──
    let ping_tunnel = tunnel.clone();
    let ping_cancel = cancel.clone();
    let ping_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if ping_tunnel.send(Frame::Ping).is_err() {
                        break;
                    }
                }
                _ = ping_cancel.cancelled() => break,
            }
        }
    });

    // ── Read Loop ──
    read_loop(&mut ws_stream, &tunnel, &subdomain).await;

    // ── Teardown ──
    info!(subdomain = %subdomain, "agent disconnected");
    tunnel.close();
    outbound_task.abort();
    ping_task.abort();
    state.registry.unregister(&tunnel);
}

/// Read frames until the connection dies, idles out, or the tunnel is
/// closed from elsewhere (takeover, shutdown).
async fn read_loop(
    ws_stream: &mut SplitStream<WebSocket>,
    tunnel: &Arc<Tunnel>,
    subdomain: &str,
) {
    let cancel = tunnel.cancellation();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(IDLE_DEADLINE, ws_stream.next()) => match result {
                Err(_) => {
                    warn!(subdomain = %subdomain, "agent idle past deadline");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(_))) => break,
                Ok(Some(Ok(message))) => message,
            },
        };

        match message {
            Message::Text(text) => {
                if text.len() > MAX_FRAME_BYTES {
                    warn!(subdomain = %subdomain, "oversized frame, closing connection");
                    break;
                }
                match decode(&text) {
                    Ok(Some(Frame::Auth { .. })) => {
                        debug!(subdomain = %subdomain, "duplicate auth frame dropped");
                    }
                    Ok(Some(frame)) => tunnel.handle_frame(frame),
                    Ok(None) => {
                        debug!(subdomain = %subdomain, "unknown frame type dropped");
                    }
                    Err(e) => {
                        warn!(subdomain = %subdomain, "protocol error, closing connection: {e}");
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            // WebSocket-level ping/pong and binary frames are not part of
            // the control protocol.
            _ => {}
        }
    }
}

/// Wait for the first text frame and extract the auth token from it.
/// Any other first frame is a protocol violation and ends the handshake.
async fn read_auth(ws_stream: &mut SplitStream<WebSocket>) -> Option<String> {
    loop {
        match ws_stream.next().await? {
            Ok(Message::Text(text)) => {
                return match decode(&text) {
                    Ok(Some(Frame::Auth { token, .. })) => Some(token),
                    _ => {
                        warn!("unexpected first frame, expected auth");
                        None
                    }
                };
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            // Ignore transport-level noise before the first text frame.
            Ok(_) => continue,
        }
    }
}

async fn send_frame(
    ws_sink: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
) -> Result<(), axum::Error> {
    let text = encode(frame).map_err(axum::Error::new)?;
    tokio::time::timeout(WRITE_DEADLINE, ws_sink.send(Message::Text(text.into())))
        .await
        .map_err(axum::Error::new)?
}
