//! # Tunnel Registry
//!
//! Process-wide map of subdomain → live [`Tunnel`]. At most one tunnel
//! per subdomain: a connecting agent that authenticates as an
//! already-connected subdomain evicts the previous connection. The
//! device's online flag in the store tracks registry membership.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

use crate::store::RegistryStore;
use crate::tunnel::Tunnel;

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active: usize,
    pub subdomains: Vec<String>,
}

pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<Tunnel>>,
    store: Arc<dyn RegistryStore>,
}

impl TunnelRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            tunnels: DashMap::new(),
            store,
        }
    }

    /// Install `tunnel` for its subdomain, closing any predecessor. The
    /// predecessor's own unregister path is a no-op afterwards because
    /// the entry no longer points at it.
    pub fn register(&self, tunnel: Arc<Tunnel>) {
        let subdomain = tunnel.device.subdomain.clone();
        let displaced = self.tunnels.insert(subdomain.clone(), tunnel.clone());

        if let Some(old) = displaced {
            if !Arc::ptr_eq(&old, &tunnel) {
                info!(subdomain = %subdomain, "tunnel replaced by newer connection");
                old.close();
            }
        }

        self.store.set_online(&tunnel.device.id, true);
        info!(subdomain = %subdomain, "tunnel registered");
    }

    /// Remove the mapping only if it still points at `tunnel`, so a
    /// takeover is not undone by the displaced connection's teardown.
    pub fn unregister(&self, tunnel: &Arc<Tunnel>) {
        let subdomain = &tunnel.device.subdomain;
        let removed = self
            .tunnels
            .remove_if(subdomain, |_, current| Arc::ptr_eq(current, tunnel))
            .is_some();

        if removed {
            self.store.set_online(&tunnel.device.id, false);
            info!(subdomain = %subdomain, "tunnel unregistered");
        }
    }

    pub fn get(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(subdomain).map(|e| e.value().clone())
    }

    pub fn stats(&self) -> RegistryStats {
        let mut subdomains: Vec<String> =
            self.tunnels.iter().map(|e| e.key().clone()).collect();
        subdomains.sort();
        RegistryStats {
            active: subdomains.len(),
            subdomains,
        }
    }
}
