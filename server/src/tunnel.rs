//! # Tunnel
//!
//! One [`Tunnel`] exists per connected agent. It owns the outbound frame
//! queue for that connection, the correlator maps matching asynchronous
//! replies to waiting callers, and the terminal session sinks. The
//! connection handler feeds inbound frames through [`Tunnel::handle_frame`]
//! and drains the outbound queue into the socket, so every write goes
//! through exactly one writer.
//!
//! Correlators are single-use rendezvous slots: a `oneshot` sender is
//! inserted before the frame is sent and removed on the first of
//! {reply, timeout, tunnel close}. Removing the entry before delivering
//! makes double delivery impossible and lets late replies be dropped
//! silently.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use burrow_protocol::{from_base64, to_base64, CommandKind, Frame, HostMetrics};

use crate::store::Device;

/// How long a proxied request may wait for its `response` frame.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an `exec` may wait for its `command_result` frame.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(90);

/// Callers that meter traffic need to know whether the frame went out:
/// `ClosedBeforeSend` means nothing was dispatched, while `Closed` and
/// `Timeout` both fire after the frame was already queued.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TunnelError {
    /// The tunnel closed while a reply was pending; the frame had
    /// already been dispatched.
    #[error("tunnel closed")]
    Closed,

    /// The tunnel was already closed when the call tried to queue its
    /// frame; nothing went out.
    #[error("tunnel closed")]
    ClosedBeforeSend,

    #[error("timed out waiting for the agent")]
    Timeout,
}

/// A decoded `response` frame, handed to the waiting proxy call.
#[derive(Debug)]
pub struct ProxiedResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// A decoded `command_result` frame.
#[derive(Debug)]
pub struct ExecResult {
    pub exit_code: i32,
    pub output: Vec<u8>,
    pub error: Option<String>,
}

/// Events routed to a terminal bridge's sink.
#[derive(Debug, PartialEq, Eq)]
pub enum TerminalEvent {
    Data(Vec<u8>),
    Close,
}

struct MetricsSnapshot {
    metrics: HostMetrics,
    at: Instant,
}

/// Removes a correlator entry when the waiting caller goes away — on
/// every return path, and also when the caller's future is dropped
/// mid-wait (public client disconnect). Keeps the maps bounded by the
/// number of live waiters.
struct SlotGuard<'a, T> {
    map: &'a DashMap<String, oneshot::Sender<T>>,
    id: &'a str,
}

impl<T> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        self.map.remove(self.id);
    }
}

pub struct Tunnel {
    /// Device snapshot taken at authentication time.
    pub device: Device,
    outbound: mpsc::UnboundedSender<Frame>,
    pending_requests: DashMap<String, oneshot::Sender<ProxiedResponse>>,
    pending_commands: DashMap<String, oneshot::Sender<ExecResult>>,
    terminal_sessions: DashMap<String, mpsc::UnboundedSender<TerminalEvent>>,
    metrics: Mutex<Option<MetricsSnapshot>>,
    cancel: CancellationToken,
}

impl Tunnel {
    /// Build a tunnel around an outbound frame queue. The caller owns the
    /// receiving half and is the connection's single writer.
    pub fn new(device: Device, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            device,
            outbound,
            pending_requests: DashMap::new(),
            pending_commands: DashMap::new(),
            terminal_sessions: DashMap::new(),
            metrics: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Token cancelled when the tunnel closes; the connection tasks
    /// select on this to shut down.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue a frame for the connection writer. Failure means the frame
    /// never went out.
    pub fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        self.outbound
            .send(frame)
            .map_err(|_| TunnelError::ClosedBeforeSend)
    }

    // ── Outbound calls ────────────────────────────────────────────

    /// Send a `request` frame and wait for the correlated `response`.
    ///
    /// The caller supplies the request id so it can account and log under
    /// the same identifier. The sink is removed on every exit path.
    pub async fn forward(
        &self,
        request_id: &str,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> Result<ProxiedResponse, TunnelError> {
        let (tx, rx) = oneshot::channel();
        self.pending_requests.insert(request_id.to_string(), tx);
        // Dropped on every exit path, so a late response frame finds no
        // sink and is dropped.
        let _slot = SlotGuard {
            map: &self.pending_requests,
            id: request_id,
        };

        let frame = Frame::Request {
            request_id: request_id.to_string(),
            method,
            path,
            headers,
            body_base64: body.as_deref().map(to_base64),
        };
        self.send(frame)?;

        tokio::select! {
            res = rx => res.map_err(|_| TunnelError::Closed),
            _ = tokio::time::sleep(FORWARD_TIMEOUT) => Err(TunnelError::Timeout),
            _ = self.cancel.cancelled() => Err(TunnelError::Closed),
        }
    }

    /// Dispatch a shell command and wait for its `command_result`.
    pub async fn exec(&self, shell: String, dry_run: bool) -> Result<ExecResult, TunnelError> {
        let command_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_commands.insert(command_id.clone(), tx);
        let _slot = SlotGuard {
            map: &self.pending_commands,
            id: &command_id,
        };

        let frame = Frame::Command {
            command_id: command_id.clone(),
            command: CommandKind::Exec,
            shell: Some(shell),
            dry_run,
        };
        self.send(frame)?;

        tokio::select! {
            res = rx => res.map_err(|_| TunnelError::Closed),
            _ = tokio::time::sleep(EXEC_TIMEOUT) => Err(TunnelError::Timeout),
            _ = self.cancel.cancelled() => Err(TunnelError::Closed),
        }
    }

    /// Fire-and-forget system reboot. No result correlation.
    pub fn reboot(&self) -> Result<(), TunnelError> {
        self.send(Frame::Command {
            command_id: Uuid::new_v4().to_string(),
            command: CommandKind::Reboot,
            shell: None,
            dry_run: false,
        })
    }

    // ── Terminal sessions ─────────────────────────────────────────

    /// Route terminal output for `session_id` to `sink`. Replaces any
    /// previous sink for the same session.
    pub fn register_terminal(&self, session_id: &str, sink: mpsc::UnboundedSender<TerminalEvent>) {
        self.terminal_sessions.insert(session_id.to_string(), sink);
    }

    pub fn unregister_terminal(&self, session_id: &str) {
        self.terminal_sessions.remove(session_id);
    }

    // ── Metrics ───────────────────────────────────────────────────

    /// Last metrics frame and its age, if the agent has reported any.
    pub fn metrics_snapshot(&self) -> Option<(HostMetrics, Duration)> {
        let guard = self.metrics.lock().ok()?;
        guard
            .as_ref()
            .map(|snap| (snap.metrics.clone(), snap.at.elapsed()))
    }

    // ── Inbound dispatch ──────────────────────────────────────────

    /// Handle one frame read from the agent.
    pub fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Response {
                request_id,
                status_code,
                headers,
                body_base64,
            } => {
                // Remove-then-send: the sink is single-use, so a second
                // response with the same id finds nothing.
                let Some((_, sink)) = self.pending_requests.remove(&request_id) else {
                    debug!(%request_id, "response for unknown request dropped");
                    return;
                };
                let body = match body_base64.as_deref().map(from_base64).transpose() {
                    Ok(body) => body.unwrap_or_default(),
                    Err(e) => {
                        warn!(%request_id, "response body is not valid base64: {e}");
                        return;
                    }
                };
                let _ = sink.send(ProxiedResponse {
                    status_code,
                    headers,
                    body,
                });
            }

            Frame::CommandResult {
                command_id,
                exit_code,
                output,
                error,
            } => {
                let Some((_, sink)) = self.pending_commands.remove(&command_id) else {
                    debug!(%command_id, "result for unknown command dropped");
                    return;
                };
                let output = match from_base64(&output) {
                    Ok(output) => output,
                    Err(e) => {
                        warn!(%command_id, "command output is not valid base64: {e}");
                        return;
                    }
                };
                let _ = sink.send(ExecResult {
                    exit_code,
                    output,
                    error,
                });
            }

            Frame::Ping => {
                let _ = self.send(Frame::Pong);
            }

            Frame::Pong => {
                // The read deadline is refreshed by frame arrival itself.
            }

            Frame::Metrics(metrics) => {
                if let Ok(mut guard) = self.metrics.lock() {
                    *guard = Some(MetricsSnapshot {
                        metrics,
                        at: Instant::now(),
                    });
                }
            }

            Frame::TerminalData {
                session_id,
                data_base64,
            } => {
                let Some(sink) = self.terminal_sessions.get(&session_id) else {
                    debug!(%session_id, "terminal data for unknown session dropped");
                    return;
                };
                match from_base64(&data_base64) {
                    Ok(data) => {
                        let _ = sink.send(TerminalEvent::Data(data));
                    }
                    Err(e) => warn!(%session_id, "terminal data is not valid base64: {e}"),
                }
            }

            Frame::TerminalClose { session_id } => {
                if let Some((_, sink)) = self.terminal_sessions.remove(&session_id) {
                    let _ = sink.send(TerminalEvent::Close);
                }
            }

            other => {
                debug!(
                    subdomain = %self.device.subdomain,
                    "unexpected frame from agent dropped: {other:?}"
                );
            }
        }
    }

    // ── Close ─────────────────────────────────────────────────────

    /// Tear the tunnel down: wake every waiting forward/exec with
    /// "tunnel closed" and tell every terminal bridge to go away.
    /// Idempotent; safe to call from the registry and the connection
    /// handler in either order.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();

        // Dropping the senders wakes receivers with RecvError, which the
        // waiters map to Closed; the cancellation token covers the rest.
        self.pending_requests.clear();
        self.pending_commands.clear();

        for entry in self.terminal_sessions.iter() {
            let _ = entry.value().send(TerminalEvent::Close);
        }
        self.terminal_sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RegistryStore, Tier};

    fn test_tunnel() -> (Tunnel, mpsc::UnboundedReceiver<Frame>) {
        let store = MemoryStore::new();
        let (device, _) = store.create_device("mypi", Tier::Free).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (Tunnel::new(device, tx), rx)
    }

    #[tokio::test]
    async fn forward_correlates_response_by_id() {
        let (tunnel, mut outbound) = test_tunnel();
        let tunnel = std::sync::Arc::new(tunnel);

        let responder = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                let frame = outbound.recv().await.unwrap();
                let Frame::Request { request_id, path, .. } = frame else {
                    panic!("expected request frame, got {frame:?}");
                };
                assert_eq!(path, "/ping");
                tunnel.handle_frame(Frame::Response {
                    request_id,
                    status_code: 200,
                    headers: HashMap::new(),
                    body_base64: Some(to_base64(b"pong")),
                });
            })
        };

        let response = tunnel
            .forward("req-1", "GET".into(), "/ping".into(), HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, b"pong");
        assert!(tunnel.pending_requests.is_empty());
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn forward_times_out_and_late_response_is_dropped() {
        let (tunnel, _outbound) = test_tunnel();

        let err = tunnel
            .forward("req-1", "GET".into(), "/slow".into(), HashMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err, TunnelError::Timeout);
        assert!(tunnel.pending_requests.is_empty());

        // The late response finds no sink; nothing blows up.
        tunnel.handle_frame(Frame::Response {
            request_id: "req-1".into(),
            status_code: 200,
            headers: HashMap::new(),
            body_base64: None,
        });
    }

    #[tokio::test]
    async fn closed_before_send_is_distinguished_from_closed_mid_wait() {
        let (tunnel, outbound) = test_tunnel();
        drop(outbound);
        tunnel.close();

        let err = tunnel
            .forward("r1", "GET".into(), "/x".into(), HashMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err, TunnelError::ClosedBeforeSend);
    }

    #[tokio::test]
    async fn close_unblocks_waiting_forward() {
        let (tunnel, _outbound) = test_tunnel();
        let tunnel = std::sync::Arc::new(tunnel);

        let waiter = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                tunnel
                    .forward("req-1", "GET".into(), "/x".into(), HashMap::new(), None)
                    .await
            })
        };

        tokio::task::yield_now().await;
        tunnel.close();

        assert_eq!(waiter.await.unwrap().unwrap_err(), TunnelError::Closed);
    }

    #[tokio::test]
    async fn response_is_delivered_at_most_once() {
        let (tunnel, _outbound) = test_tunnel();

        let (tx, mut rx) = oneshot::channel();
        tunnel.pending_requests.insert("dup".into(), tx);

        let response = Frame::Response {
            request_id: "dup".into(),
            status_code: 204,
            headers: HashMap::new(),
            body_base64: None,
        };
        tunnel.handle_frame(response.clone());
        tunnel.handle_frame(response);

        assert_eq!(rx.try_recv().unwrap().status_code, 204);
        assert!(tunnel.pending_requests.is_empty());
    }

    #[tokio::test]
    async fn exec_correlates_result() {
        let (tunnel, mut outbound) = test_tunnel();
        let tunnel = std::sync::Arc::new(tunnel);

        let responder = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                let frame = outbound.recv().await.unwrap();
                let Frame::Command { command_id, shell, dry_run, .. } = frame else {
                    panic!("expected command frame");
                };
                assert_eq!(shell.as_deref(), Some("uptime"));
                assert!(!dry_run);
                tunnel.handle_frame(Frame::CommandResult {
                    command_id,
                    exit_code: 0,
                    output: to_base64(b"up 3 days\n"),
                    error: None,
                });
            })
        };

        let result = tunnel.exec("uptime".into(), false).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, b"up 3 days\n");
        assert!(tunnel.pending_commands.is_empty());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn ping_frame_gets_a_pong() {
        let (tunnel, mut outbound) = test_tunnel();
        tunnel.handle_frame(Frame::Ping);
        assert_eq!(outbound.recv().await.unwrap(), Frame::Pong);
    }

    #[tokio::test]
    async fn metrics_snapshot_is_replaced() {
        let (tunnel, _outbound) = test_tunnel();
        assert!(tunnel.metrics_snapshot().is_none());

        tunnel.handle_frame(Frame::Metrics(HostMetrics {
            cpu_temp: 51.0,
            ..Default::default()
        }));
        let (metrics, _age) = tunnel.metrics_snapshot().unwrap();
        assert_eq!(metrics.cpu_temp, 51.0);

        tunnel.handle_frame(Frame::Metrics(HostMetrics {
            cpu_temp: 47.0,
            ..Default::default()
        }));
        let (metrics, _age) = tunnel.metrics_snapshot().unwrap();
        assert_eq!(metrics.cpu_temp, 47.0);
    }

    #[tokio::test]
    async fn terminal_data_routes_by_session() {
        let (tunnel, _outbound) = test_tunnel();

        let (sink, mut events) = mpsc::unbounded_channel();
        tunnel.register_terminal("s1", sink);

        tunnel.handle_frame(Frame::TerminalData {
            session_id: "s1".into(),
            data_base64: to_base64(b"hi"),
        });
        assert_eq!(events.recv().await.unwrap(), TerminalEvent::Data(b"hi".to_vec()));

        // Unknown sessions are dropped without side effects.
        tunnel.handle_frame(Frame::TerminalData {
            session_id: "ghost".into(),
            data_base64: to_base64(b"?"),
        });

        tunnel.handle_frame(Frame::TerminalClose {
            session_id: "s1".into(),
        });
        assert_eq!(events.recv().await.unwrap(), TerminalEvent::Close);
        assert!(tunnel.terminal_sessions.is_empty());
    }

    #[tokio::test]
    async fn close_notifies_terminal_sinks() {
        let (tunnel, _outbound) = test_tunnel();

        let (sink, mut events) = mpsc::unbounded_channel();
        tunnel.register_terminal("s1", sink);

        tunnel.close();
        assert_eq!(events.recv().await.unwrap(), TerminalEvent::Close);

        // Idempotent.
        tunnel.close();
        assert!(tunnel.is_closed());
    }
}
