//! # Server State
//!
//! Shared application state handed to every handler:
//! - **Settings**: immutable configuration loaded at startup
//! - **Store**: device identity and monthly bandwidth accounting
//! - **Registry**: subdomain → live tunnel map
//!
//! The registry is created once at startup and passed explicitly; there
//! are no hidden singletons.

use std::sync::Arc;

use crate::config::Settings;
use crate::registry::TunnelRegistry;
use crate::store::RegistryStore;

/// Shared application state, cloned into each request handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn RegistryStore>,
    pub registry: Arc<TunnelRegistry>,
}

impl AppState {
    pub fn new(settings: Settings, store: Arc<dyn RegistryStore>) -> Self {
        Self {
            settings: Arc::new(settings),
            registry: Arc::new(TunnelRegistry::new(store.clone())),
            store,
        }
    }
}
