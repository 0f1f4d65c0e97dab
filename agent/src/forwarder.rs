//! # Local HTTP Forwarder
//!
//! Replays each inbound `request` frame against the local service and
//! frames the upstream's answer as the correlated `response`. Upstream
//! failures become 502 response frames; they never touch the tunnel
//! itself.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use burrow_protocol::{from_base64, to_base64, Frame, MAX_BODY_BYTES};

/// Per-call deadline against the local service.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Hop-by-hop headers are not replayed (RFC 7230 §6.1).
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

/// Marks replayed requests so local services can recognize tunnel
/// traffic.
const SENTINEL_HEADER: &str = "x-burrow-tunnel";

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
}

pub struct LocalForwarder {
    client: reqwest::Client,
    base: String,
}

impl LocalForwarder {
    /// `base` is the local service origin, e.g. `http://127.0.0.1:3000`.
    /// Redirects are not followed; the upstream's 3xx passes through to
    /// the public caller so browser navigation still works.
    pub fn new(base: String) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, base }
    }

    /// Replay one request frame and produce its response frame.
    pub async fn handle(
        &self,
        request_id: String,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body_base64: Option<String>,
    ) -> Frame {
        let body = match body_base64.as_deref().map(from_base64).transpose() {
            Ok(body) => body.unwrap_or_default(),
            Err(e) => {
                warn!(request_id = %request_id, "request body is not valid base64: {e}");
                return error_response(request_id, "malformed request body");
            }
        };

        let url = format!("{}{}", self.base, path);
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .unwrap_or(reqwest::Method::GET);
        debug!(request_id = %request_id, %method, %url, "forwarding to local service");

        let mut header_map = HeaderMap::new();
        for (name, value) in &headers {
            if is_hop_by_hop(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                header_map.insert(name, value);
            }
        }
        // The public listener always speaks HTTPS on behalf of the device.
        header_map.insert(
            HeaderName::from_static("x-forwarded-proto"),
            HeaderValue::from_static("https"),
        );
        header_map.insert(
            HeaderName::from_static(SENTINEL_HEADER),
            HeaderValue::from_static("1"),
        );

        let mut request = self.client.request(method, &url).headers(header_map);
        if !body.is_empty() {
            request = request.body(body);
        }

        let mut response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id = %request_id, "local service call failed: {e}");
                let reason = if e.is_timeout() {
                    "local service timed out".to_string()
                } else {
                    format!("local service unreachable: {e}")
                };
                return error_response(request_id, &reason);
            }
        };

        let status_code = response.status().as_u16();
        let response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter(|(name, _)| {
                let name = name.as_str();
                !is_hop_by_hop(name) && !name.eq_ignore_ascii_case("content-length")
            })
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        // Read the body up to the cap; past it we truncate and keep the
        // upstream status.
        let mut body = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if body.len() < MAX_BODY_BYTES {
                        let take = chunk.len().min(MAX_BODY_BYTES - body.len());
                        body.extend_from_slice(&chunk[..take]);
                    }
                    if body.len() >= MAX_BODY_BYTES {
                        warn!(request_id = %request_id, "response body truncated at cap");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(request_id = %request_id, "error reading local response: {e}");
                    break;
                }
            }
        }

        Frame::Response {
            request_id,
            status_code,
            headers: response_headers,
            body_base64: (!body.is_empty()).then(|| to_base64(&body)),
        }
    }
}

/// Synthesize the 502 frame used for every upstream failure.
fn error_response(request_id: String, reason: &str) -> Frame {
    let mut headers = HashMap::new();
    headers.insert("content-type".to_string(), "text/plain".to_string());
    Frame::Response {
        request_id,
        status_code: 502,
        headers,
        body_base64: Some(to_base64(reason.as_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-custom"));
    }

    #[tokio::test]
    async fn unreachable_service_yields_a_502_frame() {
        // Port 1 refuses connections immediately.
        let forwarder = LocalForwarder::new("http://127.0.0.1:1".to_string());
        let frame = forwarder
            .handle("r1".into(), "GET".into(), "/".into(), HashMap::new(), None)
            .await;

        let Frame::Response { request_id, status_code, body_base64, .. } = frame else {
            panic!("expected response frame");
        };
        assert_eq!(request_id, "r1");
        assert_eq!(status_code, 502);
        let body = from_base64(&body_base64.unwrap()).unwrap();
        assert!(String::from_utf8_lossy(&body).contains("unreachable"));
    }

    #[tokio::test]
    async fn replays_request_and_frames_the_response() {
        // One-shot local service that records the request it saw.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 4\r\nconnection: close\r\n\r\npong",
                )
                .await
                .unwrap();
            request
        });

        let forwarder = LocalForwarder::new(format!("http://127.0.0.1:{port}"));
        let mut headers = HashMap::new();
        headers.insert("x-original".to_string(), "yes".to_string());
        headers.insert("connection".to_string(), "keep-alive".to_string());

        let frame = forwarder
            .handle("r2".into(), "GET".into(), "/ping".into(), headers, None)
            .await;

        let seen = server.await.unwrap();
        assert!(seen.starts_with("GET /ping"));
        assert!(seen.to_lowercase().contains("x-forwarded-proto: https"));
        assert!(seen.to_lowercase().contains("x-burrow-tunnel: 1"));
        assert!(seen.to_lowercase().contains("x-original: yes"));
        // Hop-by-hop request headers are not replayed verbatim.
        assert!(!seen.to_lowercase().contains("connection: keep-alive"));

        let Frame::Response { status_code, headers, body_base64, .. } = frame else {
            panic!("expected response frame");
        };
        assert_eq!(status_code, 200);
        assert_eq!(headers.get("content-type").map(String::as_str), Some("text/plain"));
        assert_eq!(from_base64(&body_base64.unwrap()).unwrap(), b"pong");
    }
}
