//! # Public Request Proxy
//!
//! Fallback handler for everything that is not the management API or a
//! WebSocket endpoint. Resolves the target tunnel from the request's
//! Host header, runs the admission chain (offline / forwarding gate /
//! monthly quota / body cap), relays the request over the tunnel, and
//! copies the correlated response back to the public caller.
//!
//! Every admitted request is metered: `len(path)+200+content_length`
//! inbound (an envelope estimate) and the response body length outbound.
//! Accounting only happens once a request frame was actually sent.

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};
use uuid::Uuid;

use burrow_protocol::MAX_BODY_BYTES;

use crate::state::AppState;
use crate::store::RegistryStore;
use crate::tunnel::TunnelError;

/// Hop-by-hop headers, stripped in both directions (RFC 7230 §6.1).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Extract the tunnel subdomain from a Host header value, given the
/// configured base domain. `mypi.example.com` with base `example.com`
/// yields `mypi`; anything else is not tunnel traffic.
pub fn resolve_subdomain(host: &str, base: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    let subdomain = host.strip_suffix(base)?.strip_suffix('.')?;
    if subdomain.is_empty() || subdomain.contains('.') {
        return None;
    }
    Some(subdomain.to_string())
}

/// Render a byte count for humans: binary steps, two decimals above
/// bytes. A value that would print as `1024.00` of one unit promotes to
/// the next, so a byte short of 1 GiB still reads `1.00 GB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1023.995 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// The 402 page shown when a device's monthly quota is exhausted.
fn quota_page(subdomain: &str, used: u64, limit: u64) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Bandwidth limit reached</title></head>\n\
         <body>\n<h1>Bandwidth limit reached</h1>\n\
         <p><strong>{subdomain}</strong> has used {} of its {} monthly \
         bandwidth allowance. Service resumes at the start of the next \
         month.</p>\n</body>\n</html>\n",
        format_bytes(used),
        format_bytes(limit),
    )
}

fn text_response(status: StatusCode, body: String) -> Response {
    (status, body).into_response()
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
}

/// Copy end-to-end headers into the frame's string map.
fn frame_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Catch-all proxy handler for subdomain traffic.
pub async fn proxy_handler(State(state): State<AppState>, req: Request<Body>) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let Some(subdomain) = resolve_subdomain(host, &state.settings.domain.base) else {
        return text_response(StatusCode::NOT_FOUND, "not found".to_string());
    };

    let Some(tunnel) = state.registry.get(&subdomain) else {
        // A known device with no live tunnel is offline, not missing.
        if state.store.lookup_by_subdomain(&subdomain).is_some() {
            return text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("{subdomain}.{} is currently offline", state.settings.domain.base),
            );
        }
        return text_response(StatusCode::NOT_FOUND, "not found".to_string());
    };

    if !tunnel.device.forwarding_enabled {
        return text_response(
            StatusCode::FORBIDDEN,
            "Tunnel forwarding is disabled".to_string(),
        );
    }

    let device_id = tunnel.device.id.clone();
    let usage = state.store.get_monthly_usage(&device_id);
    let limit = state.store.get_bandwidth_limit(&device_id);
    if usage.total() >= limit {
        return Response::builder()
            .status(StatusCode::PAYMENT_REQUIRED)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Body::from(quota_page(&subdomain, usage.total(), limit)))
            .unwrap_or_else(|_| StatusCode::PAYMENT_REQUIRED.into_response());
    }

    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let content_length: u64 = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let headers = frame_headers(req.headers());

    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return text_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body too large".to_string(),
            );
        }
    };
    let body = (!body.is_empty()).then(|| body.to_vec());

    let request_id = Uuid::new_v4().to_string();
    debug!(subdomain = %subdomain, request_id = %request_id, method = %method, path = %path, "proxying request");

    // Envelope estimate for the inbound direction.
    let bytes_in = path.len() as u64 + 200 + content_length;

    match tunnel
        .forward(&request_id, method, path, headers, body)
        .await
    {
        Ok(proxied) => {
            state
                .store
                .add_bandwidth(&device_id, bytes_in, proxied.body.len() as u64);

            let mut builder = Response::builder().status(
                StatusCode::from_u16(proxied.status_code).unwrap_or(StatusCode::BAD_GATEWAY),
            );
            for (name, value) in &proxied.headers {
                if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                    continue;
                }
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(name.as_str()),
                    HeaderValue::try_from(value.as_str()),
                ) {
                    builder = builder.header(name, value);
                }
            }
            builder
                .body(Body::from(proxied.body))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(TunnelError::Timeout) => {
            // The request frame went out; meter the inbound envelope.
            state.store.add_bandwidth(&device_id, bytes_in, 0);
            warn!(subdomain = %subdomain, request_id = %request_id, "tunnel response timed out");
            text_response(
                StatusCode::BAD_GATEWAY,
                "the tunnel did not respond in time".to_string(),
            )
        }
        Err(TunnelError::Closed) => {
            // Takeover or disconnect mid-wait: the frame was already
            // dispatched, so the inbound envelope is metered just like
            // the timeout case.
            state.store.add_bandwidth(&device_id, bytes_in, 0);
            warn!(subdomain = %subdomain, request_id = %request_id, "tunnel closed mid-request");
            text_response(StatusCode::BAD_GATEWAY, "tunnel closed".to_string())
        }
        Err(TunnelError::ClosedBeforeSend) => {
            // Nothing was sent, so nothing is metered.
            warn!(subdomain = %subdomain, request_id = %request_id, "tunnel closed before request could be sent");
            text_response(StatusCode::BAD_GATEWAY, "tunnel closed".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::store::{MemoryStore, RegistryStore, Tier};
    use crate::tunnel::Tunnel;
    use burrow_protocol::{to_base64, Frame};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn test_state() -> (AppState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut settings = Settings::default();
        settings.domain.base = "example.com".to_string();
        let state = AppState::new(settings, store.clone());
        (state, store)
    }

    fn get(host: &str, path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Register a live tunnel for `subdomain` and return its frame queue.
    fn online(
        state: &AppState,
        store: &MemoryStore,
        subdomain: &str,
    ) -> (Arc<Tunnel>, mpsc::UnboundedReceiver<Frame>) {
        store.create_device(subdomain, Tier::Free).unwrap();
        store.set_forwarding(subdomain, true).unwrap();
        let device = store.lookup_by_subdomain(subdomain).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let tunnel = Arc::new(Tunnel::new(device, tx));
        state.registry.register(tunnel.clone());
        (tunnel, rx)
    }

    #[test]
    fn subdomain_resolution() {
        assert_eq!(
            resolve_subdomain("mypi.example.com", "example.com"),
            Some("mypi".to_string())
        );
        assert_eq!(
            resolve_subdomain("mypi.example.com:8080", "example.com"),
            Some("mypi".to_string())
        );
        assert_eq!(resolve_subdomain("example.com", "example.com"), None);
        assert_eq!(resolve_subdomain("other.org", "example.com"), None);
        assert_eq!(resolve_subdomain("a.b.example.com", "example.com"), None);
        assert_eq!(resolve_subdomain("", "example.com"), None);
        // Suffix match must be on a label boundary.
        assert_eq!(resolve_subdomain("evilexample.com", "example.com"), None);
    }

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(512 * 1024 * 1024), "512.00 MB");
        assert_eq!(format_bytes(1 << 30), "1.00 GB");
        // One byte short of a GiB still renders as 1.00 GB, not 1024.00 MB.
        assert_eq!(format_bytes((1 << 30) - 1), "1.00 GB");
        assert_eq!(format_bytes(100 << 30), "100.00 GB");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));

        let copied = frame_headers(&headers);
        assert_eq!(copied.len(), 1);
        assert_eq!(copied.get("content-type").map(String::as_str), Some("text/plain"));
    }

    #[tokio::test]
    async fn unknown_subdomain_is_404() {
        let (state, _store) = test_state();
        let response = proxy_handler(State(state), get("ghost.example.com", "/")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn known_but_disconnected_device_is_503() {
        let (state, store) = test_state();
        store.create_device("dead", Tier::Free).unwrap();

        let response = proxy_handler(State(state), get("dead.example.com", "/")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_string(response).await,
            "dead.example.com is currently offline"
        );

        // No frame was sent, so nothing was metered.
        let device = store.lookup_by_subdomain("dead").unwrap();
        assert_eq!(store.get_monthly_usage(&device.id).total(), 0);
    }

    #[tokio::test]
    async fn forwarding_disabled_is_403() {
        let (state, store) = test_state();
        store.create_device("mypi", Tier::Free).unwrap();
        let device = store.lookup_by_subdomain("mypi").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        state.registry.register(Arc::new(Tunnel::new(device, tx)));

        let response = proxy_handler(State(state), get("mypi.example.com", "/")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_string(response).await, "Tunnel forwarding is disabled");
    }

    #[tokio::test]
    async fn exhausted_quota_is_402_and_sends_no_frame() {
        let (state, store) = test_state();
        let (tunnel, mut frames) = online(&state, &store, "heavy");
        store.add_bandwidth(&tunnel.device.id, (1 << 30) - 1, 1);

        let response = proxy_handler(State(state), get("heavy.example.com", "/")).await;
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let html = body_string(response).await;
        assert!(html.contains("1.00 GB"));

        assert!(frames.try_recv().is_err(), "no request frame may be sent");
    }

    #[tokio::test]
    async fn happy_path_proxies_and_meters() {
        let (state, store) = test_state();
        let (tunnel, mut frames) = online(&state, &store, "mypi");
        let device_id = tunnel.device.id.clone();

        // Stand-in agent: answer the request frame with 200 "pong".
        let responder = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                loop {
                    match frames.recv().await {
                        Some(Frame::Request { request_id, .. }) => {
                            let mut headers = HashMap::new();
                            headers.insert("content-type".to_string(), "text/plain".to_string());
                            tunnel.handle_frame(Frame::Response {
                                request_id,
                                status_code: 200,
                                headers,
                                body_base64: Some(to_base64(b"pong")),
                            });
                            break;
                        }
                        Some(_) => continue,
                        None => break,
                    }
                }
            })
        };

        let response = proxy_handler(State(state.clone()), get("mypi.example.com", "/ping")).await;
        responder.await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("text/plain")
        );
        assert_eq!(body_string(response).await, "pong");

        let usage = store.get_monthly_usage(&device_id);
        assert_eq!(usage.bytes_in, "/ping".len() as u64 + 200);
        assert_eq!(usage.bytes_out, 4);
    }

    #[tokio::test]
    async fn tunnel_closed_before_send_is_502_and_unmetered() {
        let (state, store) = test_state();
        let (tunnel, frames) = online(&state, &store, "mypi");
        drop(frames);
        tunnel.close();

        let response = proxy_handler(State(state), get("mypi.example.com", "/")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_string(response).await, "tunnel closed");

        // No request frame ever went out, so nothing is metered.
        assert_eq!(store.get_monthly_usage(&tunnel.device.id).total(), 0);
    }

    #[tokio::test]
    async fn tunnel_closing_mid_forward_is_502_and_meters_envelope() {
        let (state, store) = test_state();
        let (tunnel, mut frames) = online(&state, &store, "mypi");
        let device_id = tunnel.device.id.clone();

        // Stand-in agent that dies instead of answering: the request
        // frame is received, then the tunnel closes (as in a takeover).
        let closer = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                loop {
                    match frames.recv().await {
                        Some(Frame::Request { .. }) => {
                            tunnel.close();
                            break;
                        }
                        Some(_) => continue,
                        None => break,
                    }
                }
            })
        };

        let response = proxy_handler(State(state.clone()), get("mypi.example.com", "/late")).await;
        closer.await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_string(response).await, "tunnel closed");

        // The frame was dispatched before the close, so the inbound
        // envelope is metered; no response body ever arrived.
        let usage = store.get_monthly_usage(&device_id);
        assert_eq!(usage.bytes_in, "/late".len() as u64 + 200);
        assert_eq!(usage.bytes_out, 0);
    }
}
