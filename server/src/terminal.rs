//! # Browser Terminal Bridge
//!
//! Relays an interactive shell between a browser WebSocket and the
//! owning tunnel. The bridge allocates the session id, opens the remote
//! PTY, and then acts as a dumb byte pipe: browser keystrokes become
//! `terminal_data` frames, PTY output arrives as binary messages.
//! Terminal bytes are never interpreted here.
//!
//! Browser → bridge control format: a text message
//! `{"type": "resize", "rows": R, "cols": C}` resizes the PTY; any other
//! message is `{"data": "<keystrokes>"}`.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use burrow_protocol::{to_base64, Frame};

use crate::state::AppState;
use crate::tunnel::{TerminalEvent, Tunnel};

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

#[derive(Deserialize)]
pub struct TerminalQuery {
    token: Option<String>,
}

/// Messages the browser may send after the terminal is open.
#[derive(Debug, PartialEq, Eq)]
enum BrowserMessage {
    Resize { rows: u16, cols: u16 },
    Data(Vec<u8>),
}

/// Interpret one browser message. Malformed input yields `None` and is
/// dropped; the bridge never guesses at bytes.
fn parse_browser_message(text: &str) -> Option<BrowserMessage> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("type").and_then(|t| t.as_str()) == Some("resize") {
        let rows = value.get("rows").and_then(|r| r.as_u64()).unwrap_or(DEFAULT_ROWS as u64);
        let cols = value.get("cols").and_then(|c| c.as_u64()).unwrap_or(DEFAULT_COLS as u64);
        return Some(BrowserMessage::Resize {
            rows: rows.min(u16::MAX as u64) as u16,
            cols: cols.min(u16::MAX as u64) as u16,
        });
    }
    let data = value.get("data").and_then(|d| d.as_str())?;
    Some(BrowserMessage::Data(data.as_bytes().to_vec()))
}

/// The browser's initial message carries the terminal geometry.
fn parse_geometry(text: &str) -> (u16, u16) {
    #[derive(Deserialize, Default)]
    struct Geometry {
        rows: Option<u16>,
        cols: Option<u16>,
    }
    let geometry: Geometry = serde_json::from_str(text).unwrap_or_default();
    (
        geometry.rows.unwrap_or(DEFAULT_ROWS),
        geometry.cols.unwrap_or(DEFAULT_COLS),
    )
}

/// `GET /terminal/{subdomain}` — authenticated browser upgrade.
pub async fn terminal_handler(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let secret = &state.settings.auth.admin_token;
    if !secret.is_empty() {
        let token = query.token.unwrap_or_default();
        let authorized: bool = token.as_bytes().ct_eq(secret.as_bytes()).into();
        if !authorized {
            warn!(subdomain = %subdomain, "terminal auth failed");
            return (StatusCode::FORBIDDEN, "authentication required").into_response();
        }
    }

    let Some(tunnel) = state.registry.get(&subdomain) else {
        return (StatusCode::NOT_FOUND, "device is not connected").into_response();
    };

    ws.on_upgrade(move |socket| bridge_session(socket, tunnel))
}

/// Run one terminal session until either end hangs up.
async fn bridge_session(socket: WebSocket, tunnel: Arc<Tunnel>) {
    let session_id = Uuid::new_v4().to_string();
    let (mut browser_sink, mut browser_stream) = socket.split();

    // Exactly one initial message: the terminal geometry.
    let (rows, cols) = match browser_stream.next().await {
        Some(Ok(Message::Text(text))) => parse_geometry(&text),
        Some(Ok(_)) => (DEFAULT_ROWS, DEFAULT_COLS),
        _ => return,
    };

    // Register the sink before opening so the first burst of PTY output
    // has somewhere to land.
    let (sink_tx, mut events) = mpsc::unbounded_channel::<TerminalEvent>();
    tunnel.register_terminal(&session_id, sink_tx);

    if tunnel
        .send(Frame::TerminalOpen {
            session_id: session_id.clone(),
            rows,
            cols,
        })
        .is_err()
    {
        tunnel.unregister_terminal(&session_id);
        let _ = browser_sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "tunnel closed".into(),
            })))
            .await;
        return;
    }
    info!(subdomain = %tunnel.device.subdomain, session_id = %session_id, rows, cols, "terminal session opened");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TerminalEvent::Data(data)) => {
                    if browser_sink.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                }
                Some(TerminalEvent::Close) | None => {
                    let _ = browser_sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "session closed".into(),
                        })))
                        .await;
                    break;
                }
            },

            message = browser_stream.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Binary(data))) => {
                        match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => continue,
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };

                match parse_browser_message(&text) {
                    Some(BrowserMessage::Resize { rows, cols }) => {
                        let _ = tunnel.send(Frame::TerminalResize {
                            session_id: session_id.clone(),
                            rows,
                            cols,
                        });
                    }
                    Some(BrowserMessage::Data(data)) => {
                        let _ = tunnel.send(Frame::TerminalData {
                            session_id: session_id.clone(),
                            data_base64: to_base64(&data),
                        });
                    }
                    None => debug!(session_id = %session_id, "unparseable browser message dropped"),
                }
            },
        }
    }

    // Tear down our side and tell the agent. The unregister runs first so
    // a racing close event is not echoed back.
    tunnel.unregister_terminal(&session_id);
    let _ = tunnel.send(Frame::TerminalClose {
        session_id: session_id.clone(),
    });
    info!(session_id = %session_id, "terminal session ended");
}
