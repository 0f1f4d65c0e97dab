//! # Burrow Gateway Server
//!
//! The public half of the tunnel: terminates HTTP for `*.<base domain>`,
//! accepts persistent agent connections, and multiplexes proxied
//! requests, browser terminals, and remote commands over them.
//!
//! ## Modules
//!
//! - [`config`]   — TOML settings with env overrides
//! - [`store`]    — device identity and bandwidth accounting
//! - [`registry`] — subdomain → live tunnel map
//! - [`tunnel`]   — per-agent demultiplexer and correlators
//! - [`handlers`] — agent WebSocket lifecycle
//! - [`proxy`]    — public subdomain request proxy
//! - [`terminal`] — browser terminal bridge
//! - [`api`]      — management REST endpoints

mod api;
mod config;
mod error;
mod handlers;
mod proxy;
mod registry;
mod state;
mod store;
mod terminal;
mod tunnel;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::config::Settings;
use crate::state::AppState;
use crate::store::MemoryStore;

/// Build the full router: explicit routes on the base domain, with every
/// other request falling through to the subdomain proxy.
fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/terminal/{subdomain}", get(terminal::terminal_handler))
        .route("/api/health", get(api::health))
        .route("/api/tunnels", get(api::tunnel_stats))
        .route("/api/devices", get(api::list_devices).post(api::create_device))
        .route("/api/devices/{subdomain}/forwarding", post(api::set_forwarding))
        .route("/api/devices/{subdomain}/exec", post(api::exec_command))
        .route("/api/devices/{subdomain}/reboot", post(api::reboot_device))
        .route("/api/devices/{subdomain}/metrics", get(api::device_metrics))
        .fallback(proxy::proxy_handler)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn config_path() -> PathBuf {
    if let Some(path) = std::env::args().nth(1) {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("BURROW_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("/etc/burrow/server.toml")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "burrow_server=info,tower_http=info".into()),
        )
        .init();

    // Configuration problems surface to the operator and stop the process.
    let settings = match Settings::load(&config_path()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("burrow-server: {e}");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn store::RegistryStore> = if settings.store.path.is_empty() {
        Arc::new(MemoryStore::new())
    } else {
        match MemoryStore::open(PathBuf::from(&settings.store.path)) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                eprintln!("burrow-server: {e}");
                std::process::exit(1);
            }
        }
    };

    let addr = match settings.listen_addr() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("burrow-server: {e}");
            std::process::exit(1);
        }
    };

    let base_domain = settings.domain.base.clone();
    let state = AppState::new(settings, store);
    let app = router(state);

    info!(%addr, domain = %base_domain, "burrow gateway listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("burrow-server: failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("burrow-server: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    use crate::store::{RegistryStore, Tier};

    fn test_app() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut settings = Settings::default();
        settings.domain.base = "example.com".to_string();
        (router(AppState::new(settings, store.clone())), store)
    }

    #[tokio::test]
    async fn health_endpoint_answers_on_the_base_domain() {
        let (app, _store) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .header(header::HOST, "example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn subdomain_traffic_falls_through_to_the_proxy() {
        let (app, store) = test_app();
        store.create_device("dead", Tier::Free).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/anything")
                    .header(header::HOST, "dead.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn tunnel_stats_start_empty() {
        let (app, _store) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/tunnels")
                    .header(header::HOST, "example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["active"], 0);
    }
}
