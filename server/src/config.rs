//! # Server Configuration
//!
//! Loaded from a TOML file at startup, with environment variable
//! overrides for containerized deployments. A missing file yields the
//! defaults; an unreadable or invalid file is fatal.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Public base domain; `<subdomain>.<base>` routes into a tunnel.
    pub base: String,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            base: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token for the management API and terminal bridge.
    /// Empty disables the gate (development only).
    pub admin_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Optional JSON snapshot path for the registry store.
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listen: ListenConfig,
    pub domain: DomainConfig,
    pub auth: AuthConfig,
    pub store: StoreConfig,
}

impl Settings {
    /// Load settings from `path` (defaults apply when it does not exist),
    /// then apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| ServerError::Config(format!("failed to read {}: {e}", path.display())))?;
            toml::from_str(&content)
                .map_err(|e| ServerError::Config(format!("failed to parse {}: {e}", path.display())))?
        } else {
            Settings::default()
        };

        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("BURROW_LISTEN_ADDR") {
            if let Some((host, port)) = addr.rsplit_once(':') {
                if let Ok(port) = port.parse() {
                    self.listen.host = host.to_string();
                    self.listen.port = port;
                }
            }
        }
        if let Ok(domain) = std::env::var("BURROW_DOMAIN") {
            self.domain.base = domain;
        }
        if let Ok(token) = std::env::var("BURROW_ADMIN_TOKEN") {
            self.auth.admin_token = token;
        }
        if let Ok(path) = std::env::var("BURROW_STORE_PATH") {
            self.store.path = path;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.listen.port == 0 {
            return Err(ServerError::Config("listen.port must be non-zero".into()));
        }
        if self.domain.base.trim().is_empty() {
            return Err(ServerError::Config("domain.base must be set".into()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.listen.host, self.listen.port)
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid listen address: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_full_toml() {
        let toml_str = r#"
[listen]
host = "127.0.0.1"
port = 9090

[domain]
base = "example.com"

[auth]
admin_token = "s3cret"

[store]
path = "/var/lib/burrow/store.json"
"#;
        let settings: Settings = toml::from_str(toml_str).unwrap();
        assert_eq!(settings.listen.host, "127.0.0.1");
        assert_eq!(settings.listen.port, 9090);
        assert_eq!(settings.domain.base, "example.com");
        assert_eq!(settings.auth.admin_token, "s3cret");
        assert_eq!(settings.store.path, "/var/lib/burrow/store.json");
    }

    #[test]
    fn parse_minimal_toml() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.listen.host, "0.0.0.0");
        assert_eq!(settings.listen.port, 8080);
        assert_eq!(settings.domain.base, "localhost");
        assert!(settings.auth.admin_token.is_empty());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/burrow.toml")).unwrap();
        assert_eq!(settings.listen.port, 8080);
    }

    #[test]
    fn invalid_toml_is_fatal() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{not toml").unwrap();
        assert!(Settings::load(file.path()).is_err());
    }

    #[test]
    fn zero_port_is_rejected() {
        let settings = Settings {
            listen: ListenConfig {
                host: "0.0.0.0".into(),
                port: 0,
            },
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn listen_addr_parses() {
        let settings = Settings::default();
        assert_eq!(settings.listen_addr().unwrap().port(), 8080);
    }
}
