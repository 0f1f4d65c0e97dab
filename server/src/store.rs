//! # Registry Store
//!
//! Authoritative device identity and monthly bandwidth accounting:
//! - **Devices**: stable id, unique subdomain, hashed auth token,
//!   forwarding flag, tier, online flag
//! - **Usage**: additive `(device_id, YYYY-MM)` byte counters
//!
//! Tokens are hashed (SHA-256) before they touch the store; the
//! plaintext exists only in the provisioning response and on the agent.
//! All maps use [`DashMap`] since the proxy, the tunnel handlers, and
//! the API mutate the store concurrently.

use std::path::PathBuf;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, ServerError};

/// Quota class determining the monthly byte limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
}

impl Tier {
    /// Monthly bandwidth allowance in bytes.
    pub fn bandwidth_limit(self) -> u64 {
        match self {
            Tier::Free => 1 << 30,    // 1 GiB
            Tier::Pro => 100 << 30,   // 100 GiB
        }
    }
}

/// A registered device. `token_hash` never leaves the store layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub subdomain: String,
    pub token_hash: String,
    pub forwarding_enabled: bool,
    pub tier: Tier,
    pub online: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Monthly byte counters. Monotonically non-decreasing within a month.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyUsage {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl MonthlyUsage {
    pub fn total(self) -> u64 {
        self.bytes_in.saturating_add(self.bytes_out)
    }
}

/// Subdomains that can never be claimed by a device.
pub const RESERVED_SUBDOMAINS: &[&str] = &[
    "www", "api", "admin", "app", "dashboard", "mail", "smtp", "ftp", "ns1",
    "ns2", "blog", "dev", "staging", "status", "support", "help", "docs",
];

/// Validate a subdomain: 3–30 chars, lowercase ASCII alphanumeric with
/// interior hyphens only, and not on the reserved list.
pub fn validate_subdomain(subdomain: &str) -> bool {
    let len = subdomain.len();
    if !(3..=30).contains(&len) {
        return false;
    }
    if subdomain.starts_with('-') || subdomain.ends_with('-') {
        return false;
    }
    if !subdomain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return false;
    }
    !RESERVED_SUBDOMAINS.contains(&subdomain)
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Current accounting period, `YYYY-MM`.
fn month_key() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}

/// The store interface the data plane consumes. Implementations must be
/// idempotent and thread-safe.
pub trait RegistryStore: Send + Sync {
    fn lookup_by_token(&self, token: &str) -> Option<Device>;
    fn lookup_by_subdomain(&self, subdomain: &str) -> Option<Device>;
    fn set_online(&self, device_id: &str, online: bool);
    fn add_bandwidth(&self, device_id: &str, bytes_in: u64, bytes_out: u64);
    fn get_monthly_usage(&self, device_id: &str) -> MonthlyUsage;
    fn get_bandwidth_limit(&self, device_id: &str) -> u64;
    fn is_over_limit(&self, device_id: &str) -> bool;

    // Provisioning surface, used by the management API.
    fn create_device(&self, subdomain: &str, tier: Tier) -> Result<(Device, String)>;
    fn set_forwarding(&self, subdomain: &str, enabled: bool) -> Result<()>;
    fn list_devices(&self) -> Vec<Device>;
}

/// On-disk snapshot shape for [`MemoryStore`] persistence.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    devices: Vec<Device>,
    usage: Vec<(String, String, MonthlyUsage)>,
}

/// In-process store with optional JSON snapshot persistence.
pub struct MemoryStore {
    /// device_id → Device
    devices: DashMap<String, Device>,
    /// subdomain → device_id
    subdomains: DashMap<String, String>,
    /// token_hash → device_id
    tokens: DashMap<String, String>,
    /// (device_id, YYYY-MM) → usage
    usage: DashMap<(String, String), MonthlyUsage>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
            subdomains: DashMap::new(),
            tokens: DashMap::new(),
            usage: DashMap::new(),
            snapshot_path: None,
        }
    }

    /// Open a store backed by a JSON snapshot file. A missing file starts
    /// empty; an unreadable one is a startup error.
    pub fn open(path: PathBuf) -> Result<Self> {
        let store = Self {
            snapshot_path: Some(path.clone()),
            ..Self::new()
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let snapshot: Snapshot = serde_json::from_str(&content)
                .map_err(|e| ServerError::Config(format!("corrupt store snapshot: {e}")))?;
            for device in snapshot.devices {
                store.subdomains.insert(device.subdomain.clone(), device.id.clone());
                store.tokens.insert(device.token_hash.clone(), device.id.clone());
                store.devices.insert(device.id.clone(), device);
            }
            for (id, month, usage) in snapshot.usage {
                store.usage.insert((id, month), usage);
            }
        }

        Ok(store)
    }

    /// Best-effort snapshot rewrite. Accounting must not fail because the
    /// disk is unhappy, so errors are logged and swallowed.
    fn persist(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let snapshot = Snapshot {
            devices: self.devices.iter().map(|e| e.value().clone()).collect(),
            usage: self
                .usage
                .iter()
                .map(|e| (e.key().0.clone(), e.key().1.clone(), *e.value()))
                .collect(),
        };
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!("failed to persist store snapshot: {e}");
                }
            }
            Err(e) => warn!("failed to serialize store snapshot: {e}"),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryStore for MemoryStore {
    fn lookup_by_token(&self, token: &str) -> Option<Device> {
        let id = self.tokens.get(&hash_token(token))?.value().clone();
        self.devices.get(&id).map(|d| d.value().clone())
    }

    fn lookup_by_subdomain(&self, subdomain: &str) -> Option<Device> {
        let id = self.subdomains.get(subdomain)?.value().clone();
        self.devices.get(&id).map(|d| d.value().clone())
    }

    fn set_online(&self, device_id: &str, online: bool) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.online = online;
            device.updated_at = chrono::Utc::now();
        }
        self.persist();
    }

    fn add_bandwidth(&self, device_id: &str, bytes_in: u64, bytes_out: u64) {
        let key = (device_id.to_string(), month_key());
        let mut entry = self.usage.entry(key).or_default();
        entry.bytes_in = entry.bytes_in.saturating_add(bytes_in);
        entry.bytes_out = entry.bytes_out.saturating_add(bytes_out);
        drop(entry);
        self.persist();
    }

    fn get_monthly_usage(&self, device_id: &str) -> MonthlyUsage {
        self.usage
            .get(&(device_id.to_string(), month_key()))
            .map(|u| *u.value())
            .unwrap_or_default()
    }

    fn get_bandwidth_limit(&self, device_id: &str) -> u64 {
        self.devices
            .get(device_id)
            .map(|d| d.tier.bandwidth_limit())
            .unwrap_or(Tier::Free.bandwidth_limit())
    }

    fn is_over_limit(&self, device_id: &str) -> bool {
        self.get_monthly_usage(device_id).total() >= self.get_bandwidth_limit(device_id)
    }

    fn create_device(&self, subdomain: &str, tier: Tier) -> Result<(Device, String)> {
        if !validate_subdomain(subdomain) {
            return Err(ServerError::InvalidSubdomain(subdomain.to_string()));
        }
        if self.subdomains.contains_key(subdomain) {
            return Err(ServerError::SubdomainTaken(subdomain.to_string()));
        }

        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let now = chrono::Utc::now();
        let device = Device {
            id: Uuid::new_v4().to_string(),
            subdomain: subdomain.to_string(),
            token_hash: hash_token(&token),
            // Forwarding is an explicit opt-in after provisioning.
            forwarding_enabled: false,
            tier,
            online: false,
            created_at: now,
            updated_at: now,
        };

        self.subdomains.insert(device.subdomain.clone(), device.id.clone());
        self.tokens.insert(device.token_hash.clone(), device.id.clone());
        self.devices.insert(device.id.clone(), device.clone());
        self.persist();

        Ok((device, token))
    }

    fn set_forwarding(&self, subdomain: &str, enabled: bool) -> Result<()> {
        let id = self
            .subdomains
            .get(subdomain)
            .map(|e| e.value().clone())
            .ok_or(ServerError::DeviceNotFound)?;
        if let Some(mut device) = self.devices.get_mut(&id) {
            device.forwarding_enabled = enabled;
            device.updated_at = chrono::Utc::now();
        }
        self.persist();
        Ok(())
    }

    fn list_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.iter().map(|e| e.value().clone()).collect();
        devices.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        devices
    }
}
