//! # Agent Configuration
//!
//! Four keys drive the data plane: the server connect URL, the device
//! token, and the local host/port requests are replayed against.
//! Resolution order: command-line flag > per-user config file >
//! system-wide config file. Missing required keys after merging are a
//! startup error.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{AgentError, Result};

pub const SYSTEM_CONFIG_PATH: &str = "/etc/burrow/agent.toml";

const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";
const DEFAULT_LOCAL_PORT: u16 = 8080;

/// Values taken from the command line; each one outranks the files.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server: Option<String>,
    pub token: Option<String>,
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
    /// Explicit config file path, replacing the user/system lookup.
    pub config: Option<PathBuf>,
}

/// One configuration file layer. Every key is optional so layers merge.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    server: Option<String>,
    token: Option<String>,
    local_host: Option<String>,
    local_port: Option<u16>,
}

impl FileConfig {
    fn load(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| AgentError::Config(format!("failed to parse {}: {e}", path.display())))
    }
}

/// Fully-resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Tunnel connect URL, e.g. `wss://gateway.example.com/ws`.
    pub server: String,
    /// Device auth token. Never logged.
    pub token: String,
    pub local_host: String,
    pub local_port: u16,
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("burrow/agent.toml"))
}

impl AgentConfig {
    /// Merge the configured layers and validate the result.
    pub fn resolve(overrides: Overrides) -> Result<Self> {
        let layers: Vec<FileConfig> = if let Some(path) = &overrides.config {
            if !path.exists() {
                return Err(AgentError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            vec![FileConfig::load(path)?]
        } else {
            let mut layers = Vec::new();
            if let Some(path) = user_config_path() {
                layers.push(FileConfig::load(&path)?);
            }
            layers.push(FileConfig::load(&PathBuf::from(SYSTEM_CONFIG_PATH))?);
            layers
        };

        let pick = |from_cli: Option<String>, field: fn(&FileConfig) -> Option<String>| {
            from_cli.or_else(|| layers.iter().find_map(field))
        };

        let server = pick(overrides.server, |f| f.server.clone())
            .ok_or_else(|| AgentError::Config("no server URL configured".into()))?;
        let token = pick(overrides.token, |f| f.token.clone())
            .ok_or_else(|| AgentError::Config("no device token configured".into()))?;
        let local_host = pick(overrides.local_host, |f| f.local_host.clone())
            .unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_string());
        let local_port = overrides
            .local_port
            .or_else(|| layers.iter().find_map(|f| f.local_port))
            .unwrap_or(DEFAULT_LOCAL_PORT);

        if !server.starts_with("ws://") && !server.starts_with("wss://") {
            return Err(AgentError::Config(format!(
                "server URL must be ws:// or wss://, got {server}"
            )));
        }
        if token.trim().is_empty() {
            return Err(AgentError::Config("device token is empty".into()));
        }

        Ok(Self {
            server,
            token,
            local_host,
            local_port,
        })
    }

    /// Base URL of the local service requests are replayed against.
    pub fn local_base(&self) -> String {
        format!("http://{}:{}", self.local_host, self.local_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{content}").unwrap();
        file
    }

    #[test]
    fn file_layer_provides_values() {
        let file = write_config(
            r#"
server = "wss://gateway.example.com/ws"
token = "tok123"
local_port = 3000
"#,
        );
        let config = AgentConfig::resolve(Overrides {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.server, "wss://gateway.example.com/ws");
        assert_eq!(config.token, "tok123");
        assert_eq!(config.local_host, "127.0.0.1");
        assert_eq!(config.local_port, 3000);
        assert_eq!(config.local_base(), "http://127.0.0.1:3000");
    }

    #[test]
    fn cli_outranks_file() {
        let file = write_config(
            r#"
server = "wss://file.example.com/ws"
token = "file-token"
"#,
        );
        let config = AgentConfig::resolve(Overrides {
            server: Some("ws://cli.example.com/ws".into()),
            token: Some("cli-token".into()),
            local_port: Some(9000),
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.server, "ws://cli.example.com/ws");
        assert_eq!(config.token, "cli-token");
        assert_eq!(config.local_port, 9000);
    }

    #[test]
    fn missing_required_keys_are_fatal() {
        let file = write_config("local_port = 3000\n");
        let err = AgentConfig::resolve(Overrides {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("server"));
    }

    #[test]
    fn non_websocket_url_is_rejected() {
        let file = write_config("");
        let err = AgentConfig::resolve(Overrides {
            server: Some("https://gateway.example.com".into()),
            token: Some("tok".into()),
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        });
        assert!(err.is_err());
    }

    #[test]
    fn explicit_missing_config_file_is_fatal() {
        let err = AgentConfig::resolve(Overrides {
            config: Some(PathBuf::from("/nonexistent/agent.toml")),
            ..Default::default()
        });
        assert!(err.is_err());
    }
}
