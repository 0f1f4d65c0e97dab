//! # Tunnel Client Loop
//!
//! Maintains the persistent connection to the gateway:
//! - Connect and authenticate (auth must be answered within 10 s)
//! - Steady state: dispatch inbound frames to the forwarder, PTY
//!   manager, and executor; heartbeat every 30 s
//! - Reconnect with jittered exponential backoff on any failure
//! - A local stop closes everything and never reconnects
//!
//! All outbound traffic funnels through one writer task per connection;
//! handlers queue frames instead of touching the socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use burrow_protocol::{decode, encode, from_base64, CommandKind, Frame, MAX_FRAME_BYTES};

use crate::backoff::Backoff;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::executor;
use crate::forwarder::LocalForwarder;
use crate::metrics::MetricsSampler;
use crate::pty::PtyManager;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Heartbeat cadence; a ping and a metrics frame go out together.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive unanswered pings before the connection is declared dead.
const MAX_MISSED_PONGS: u32 = 3;

/// Deadline for the transport connect and for the auth reply.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the agent until `shutdown` fires. Never returns early on
/// connection failures; those feed the backoff schedule.
pub async fn run(config: AgentConfig, shutdown: CancellationToken) {
    let mut backoff = Backoff::new();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        info!(server = %config.server, "connecting to gateway");
        match run_connection(&config, &shutdown).await {
            Ok(connected_for) => {
                info!(
                    seconds = connected_for.as_secs(),
                    "disconnected from gateway"
                );
                backoff.record_connected(connected_for);
            }
            Err(e) => warn!("connection attempt failed: {e}"),
        }

        if shutdown.is_cancelled() {
            break;
        }

        let delay = backoff.next_delay();
        info!("reconnecting in {:.1}s", delay.as_secs_f64());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    info!("agent stopped");
}

/// One connection lifecycle: connect, authenticate, serve, clean up.
/// Returns how long the authenticated session lasted.
async fn run_connection(
    config: &AgentConfig,
    shutdown: &CancellationToken,
) -> Result<Duration> {
    let connect = connect_async(&config.server);
    let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| AgentError::Connection("transport connect timed out".into()))?
        .map_err(|e| AgentError::Connection(e.to_string()))?;

    let (mut ws_sink, mut ws_stream_rx) = ws_stream.split();

    // ── Auth handshake ──
    let auth = Frame::Auth {
        token: config.token.clone(),
        client_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let text = encode(&auth).map_err(|e| AgentError::Connection(e.to_string()))?;
    ws_sink
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| AgentError::Connection(e.to_string()))?;

    let subdomain = tokio::time::timeout(AUTH_TIMEOUT, wait_auth_result(&mut ws_stream_rx))
        .await
        .map_err(|_| AgentError::Connection("timed out waiting for auth result".into()))??;

    info!(subdomain = %subdomain, "tunnel established");
    let connected_at = Instant::now();

    // ── Per-connection state ──
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let forwarder = Arc::new(LocalForwarder::new(config.local_base()));
    let pty = Arc::new(PtyManager::new(tx.clone()));
    let mut sampler = MetricsSampler::new();
    // Cancels in-flight local HTTP calls when the connection dies.
    let conn_cancel = shutdown.child_token();

    // ── Outbound Writer Task ──
    let outbound = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match encode(&frame) {
                Ok(text) => text,
                Err(e) => {
                    error!("failed to serialize frame: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // ── Steady-state loop ──
    let mut heartbeat = tokio::time::interval(PING_INTERVAL);
    heartbeat.tick().await; // the first tick fires immediately; skip it
    let mut pings_unanswered: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("local stop requested, closing tunnel");
                break;
            }

            _ = heartbeat.tick() => {
                if pings_unanswered >= MAX_MISSED_PONGS {
                    warn!("{MAX_MISSED_PONGS} pings unanswered, reconnecting");
                    break;
                }
                pings_unanswered += 1;
                if tx.send(Frame::Ping).is_err() {
                    break;
                }
                let _ = tx.send(Frame::Metrics(sampler.sample()));
            }

            message = ws_stream_rx.next() => match message {
                None | Some(Err(_)) => break,
                Some(Ok(Message::Text(text))) => {
                    if text.len() > MAX_FRAME_BYTES {
                        warn!("oversized frame from server, reconnecting");
                        break;
                    }
                    match decode(&text) {
                        Ok(Some(Frame::Pong)) => pings_unanswered = 0,
                        Ok(Some(frame)) => {
                            dispatch(frame, &tx, &forwarder, &pty, &conn_cancel).await;
                        }
                        Ok(None) => debug!("unknown frame type dropped"),
                        Err(e) => {
                            warn!("protocol error, reconnecting: {e}");
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    // ── Disconnect cleanup ──
    // Kill PTY children and stop in-flight forwards; the writer gets a
    // moment to flush the terminal_close frames, then everything drops.
    conn_cancel.cancel();
    pty.close_all().await;
    tokio::task::yield_now().await;
    outbound.abort();

    Ok(connected_at.elapsed())
}

/// Read frames until the auth reply arrives. Anything else first is a
/// protocol violation.
async fn wait_auth_result(ws_stream_rx: &mut futures::stream::SplitStream<WsStream>) -> Result<String> {
    loop {
        let message = ws_stream_rx
            .next()
            .await
            .ok_or_else(|| AgentError::Connection("connection closed during auth".into()))?
            .map_err(|e| AgentError::Connection(e.to_string()))?;

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => {
                return Err(AgentError::Connection("connection closed during auth".into()));
            }
            // Transport-level frames are not part of the handshake.
            _ => continue,
        };

        return match decode(&text) {
            Ok(Some(Frame::AuthResult {
                success: true,
                subdomain,
                ..
            })) => Ok(subdomain.unwrap_or_default()),
            Ok(Some(Frame::AuthResult {
                success: false,
                message,
                ..
            })) => Err(AgentError::Connection(format!(
                "auth rejected: {}",
                message.unwrap_or_else(|| "no reason given".into())
            ))),
            Ok(Some(other)) => Err(AgentError::Connection(format!(
                "unexpected first frame: {other:?}"
            ))),
            Ok(None) => Err(AgentError::Connection("unexpected first frame".into())),
            Err(e) => Err(AgentError::Connection(format!("protocol error: {e}"))),
        };
    }
}

/// Route one inbound frame to the component that owns it.
async fn dispatch(
    frame: Frame,
    tx: &mpsc::UnboundedSender<Frame>,
    forwarder: &Arc<LocalForwarder>,
    pty: &Arc<PtyManager>,
    conn_cancel: &CancellationToken,
) {
    match frame {
        Frame::Request {
            request_id,
            method,
            path,
            headers,
            body_base64,
        } => {
            // Requests proxy concurrently; each one owns a task.
            let forwarder = forwarder.clone();
            let tx = tx.clone();
            let cancel = conn_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    frame = forwarder.handle(request_id, method, path, headers, body_base64) => {
                        let _ = tx.send(frame);
                    }
                    _ = cancel.cancelled() => {}
                }
            });
        }

        Frame::Command {
            command_id,
            command: CommandKind::Reboot,
            ..
        } => {
            debug!(command_id = %command_id, "reboot command received");
            executor::run_reboot();
        }

        Frame::Command {
            command_id,
            command: CommandKind::Exec,
            shell,
            dry_run,
        } => {
            let tx = tx.clone();
            let cancel = conn_cancel.clone();
            tokio::spawn(async move {
                let Some(shell) = shell else {
                    let _ = tx.send(Frame::CommandResult {
                        command_id,
                        exit_code: -1,
                        output: String::new(),
                        error: Some("exec command without a shell string".into()),
                    });
                    return;
                };
                tokio::select! {
                    outcome = executor::run_exec(&shell, dry_run) => {
                        let _ = tx.send(outcome.into_frame(command_id));
                    }
                    _ = cancel.cancelled() => {}
                }
            });
        }

        Frame::TerminalOpen {
            session_id,
            rows,
            cols,
        } => pty.open(session_id, rows, cols).await,

        Frame::TerminalData {
            session_id,
            data_base64,
        } => match from_base64(&data_base64) {
            Ok(data) => pty.write(&session_id, &data).await,
            Err(e) => warn!(session_id = %session_id, "terminal data is not valid base64: {e}"),
        },

        Frame::TerminalResize {
            session_id,
            rows,
            cols,
        } => pty.resize(&session_id, rows, cols).await,

        Frame::TerminalClose { session_id } => pty.close(&session_id).await,

        // The server pings over the same frame vocabulary; answer so its
        // read deadline refreshes even when nothing else is flowing.
        Frame::Ping => {
            let _ = tx.send(Frame::Pong);
        }

        Frame::Error { code, message } => {
            warn!(code = %code, "server error: {message}");
        }

        other => debug!("unexpected frame from server dropped: {other:?}"),
    }
}
