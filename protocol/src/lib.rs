//! # Control-Connection Frames
//!
//! Defines every message exchanged between an agent and the server over
//! the persistent tunnel connection. Frames are JSON text messages using
//! serde's internally-tagged representation (`"type": "..."` field with
//! snake_case variant names), so `Frame::AuthResult` serializes to
//! `{"type": "auth_result", ...}`.
//!
//! Binary payloads (HTTP bodies, terminal bytes) travel as base64 strings
//! in dedicated `*_base64` fields. Decoding is tolerant: unknown `type`
//! tags are skipped (the caller logs and drops them), unknown fields are
//! ignored, and missing optional fields default. Only genuinely malformed
//! or oversized frames are errors — those terminate the connection.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// Hard cap on a single inbound frame. Leaves headroom above the HTTP
/// body cap for base64 expansion plus headers.
pub const MAX_FRAME_BYTES: usize = 12 * 1024 * 1024;

/// Hard cap on a tunneled HTTP body, in either direction.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Host metrics reported by the agent alongside each heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    /// CPU temperature in °C; 0.0 when the host exposes no sensor.
    pub cpu_temp: f64,
    pub mem_total: u64,
    pub mem_free: u64,
    pub disk_total: u64,
    pub disk_free: u64,
    /// Seconds since boot.
    pub uptime: u64,
    /// One-minute load average.
    pub load_avg: f64,
}

/// Remote command kinds the server may dispatch to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Fire-and-forget system reboot; no result frame is sent back.
    Reboot,
    /// Run a shell string and reply with a `command_result` frame.
    Exec,
}

/// All frames on the control connection.
///
/// Client → server: `auth`, `ping`, `response`, `metrics`,
/// `command_result`, `terminal_data`, `terminal_close`.
/// Server → client: `auth_result`, `pong`, `error`, `request`, `command`,
/// `terminal_open`, `terminal_resize`, `terminal_close`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    // ── Handshake ─────────────────────────────────────────────────

    /// First frame on every connection. The server must see it within
    /// its auth deadline or the connection is dropped.
    Auth { token: String, client_version: String },

    /// The server's single reply to `auth`.
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    // ── Heartbeat ─────────────────────────────────────────────────

    Ping,
    Pong,

    /// Fatal or advisory error notification.
    Error { code: String, message: String },

    // ── HTTP proxying ─────────────────────────────────────────────

    /// A public HTTP request the agent must replay against its local
    /// service. Correlated with the matching `response` by `request_id`.
    Request {
        request_id: String,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body_base64: Option<String>,
    },

    /// The agent's reply to a `request` frame. May arrive in any order;
    /// matching is strictly by `request_id`.
    Response {
        request_id: String,
        status_code: u16,
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body_base64: Option<String>,
    },

    // ── Telemetry ─────────────────────────────────────────────────

    /// Periodic host metrics, sent alongside `ping`.
    Metrics(HostMetrics),

    // ── Remote commands ───────────────────────────────────────────

    Command {
        command_id: String,
        command: CommandKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
        #[serde(default)]
        dry_run: bool,
    },

    /// Reply to an `exec` command. `output` is base64 of the combined
    /// stdout+stderr, truncated at the executor's cap.
    CommandResult {
        command_id: String,
        exit_code: i32,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ── Interactive terminal ──────────────────────────────────────

    TerminalOpen {
        session_id: String,
        rows: u16,
        cols: u16,
    },

    TerminalResize {
        session_id: String,
        rows: u16,
        cols: u16,
    },

    /// PTY bytes in either direction. Ordering is guaranteed per session.
    TerminalData {
        session_id: String,
        data_base64: String,
    },

    /// Session ended; sent by whichever side tears the session down.
    TerminalClose { session_id: String },
}

/// Tags the decoder recognizes. A frame whose `type` is not listed here
/// is skipped rather than treated as a protocol violation, so the wire
/// format can grow without breaking older peers.
const KNOWN_TYPES: &[&str] = &[
    "auth",
    "auth_result",
    "ping",
    "pong",
    "error",
    "request",
    "response",
    "metrics",
    "command",
    "command_result",
    "terminal_open",
    "terminal_resize",
    "terminal_data",
    "terminal_close",
];

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    Oversize(usize),

    #[error("frame is not a JSON object with a string `type` field")]
    MissingType,

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decode one text frame.
///
/// Returns `Ok(None)` for a well-formed frame with an unrecognized
/// `type`; the caller should log and drop it. All `Err` cases are
/// connection-fatal protocol errors.
pub fn decode(text: &str) -> Result<Option<Frame>, CodecError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(CodecError::Oversize(text.len()));
    }

    let value: serde_json::Value = serde_json::from_str(text)?;
    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(CodecError::MissingType)?;

    if !KNOWN_TYPES.contains(&tag) {
        return Ok(None);
    }

    Ok(Some(serde_json::from_value(value)?))
}

/// Encode a frame as a JSON text message.
pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

/// Base64-encode a binary payload for a `*_base64` field.
pub fn to_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a `*_base64` field back to bytes.
pub fn from_base64(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(s)
}
