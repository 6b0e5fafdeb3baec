//! Server configuration: TOML file + CLI overrides.

use crate::handshake::AuthPolicy;
use crate::relay::rpc::DEFAULT_RPC_TIMEOUT;
use serde::Deserialize;
use spawn_relay_core::{RelayError, RelayResult};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_hello_timeout_secs")]
    pub hello_timeout_secs: u64,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
            hello_timeout_secs: default_hello_timeout_secs(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded HMAC secret for identity tokens.
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default)]
    pub require_token: bool,
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    3005
}
fn default_rpc_timeout_secs() -> u64 {
    DEFAULT_RPC_TIMEOUT.as_secs()
}
fn default_hello_timeout_secs() -> u64 {
    10
}
fn default_max_frame_size() -> usize {
    1_048_576
}

/// CLI values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub rpc_timeout_secs: Option<u64>,
    pub token_secret: Option<String>,
    pub require_token: bool,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub rpc_timeout: Duration,
    pub hello_timeout: Duration,
    pub max_frame_size: usize,
    pub auth: AuthPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let server = ServerSection::default();
        Self {
            listen_addr: SocketAddr::new(server.bind, server.port),
            rpc_timeout: Duration::from_secs(server.rpc_timeout_secs),
            hello_timeout: Duration::from_secs(server.hello_timeout_secs),
            max_frame_size: server.max_frame_size,
            auth: AuthPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RelayError::Other(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> RelayResult<Self> {
        let bind = overrides.bind.unwrap_or(file.server.bind);
        let port = overrides.port.unwrap_or(file.server.port);
        let rpc_timeout_secs = overrides
            .rpc_timeout_secs
            .unwrap_or(file.server.rpc_timeout_secs);

        let token_secret = overrides
            .token_secret
            .or(file.auth.token_secret)
            .map(|hex_secret| {
                hex::decode(hex_secret.trim())
                    .map_err(|e| RelayError::Other(format!("auth.token_secret is not hex: {e}")))
            })
            .transpose()?;
        let require_token = overrides.require_token || file.auth.require_token;
        if require_token && token_secret.is_none() {
            return Err(RelayError::Other(
                "auth.require_token is set but no token_secret is configured".into(),
            ));
        }

        Ok(Self {
            listen_addr: SocketAddr::new(bind, port),
            rpc_timeout: Duration::from_secs(rpc_timeout_secs),
            hello_timeout: Duration::from_secs(file.server.hello_timeout_secs),
            max_frame_size: file.server.max_frame_size,
            auth: AuthPolicy {
                token_secret,
                require_token,
            },
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr.port(), 3005);
        assert_eq!(config.rpc_timeout, Duration::from_secs(30));
        assert!(!config.auth.require_token);
        assert!(config.auth.token_secret.is_none());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let path = Path::new("/nonexistent/relay.toml");
        let config = ServerConfig::load(Some(path), ConfigOverrides::default()).unwrap();
        assert_eq!(config.listen_addr.port(), 3005);
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nport = 4000\nrpc_timeout_secs = 5\nmax_frame_size = 2048\n\n[auth]\ntoken_secret = \"00ff\"\nrequire_token = true"
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path()), ConfigOverrides::default()).unwrap();
        assert_eq!(config.listen_addr.port(), 4000);
        assert_eq!(config.rpc_timeout, Duration::from_secs(5));
        assert_eq!(config.max_frame_size, 2048);
        assert_eq!(config.auth.token_secret, Some(vec![0x00, 0xff]));
        assert!(config.auth.require_token);

        let overrides = ConfigOverrides {
            port: Some(5000),
            rpc_timeout_secs: Some(60),
            ..Default::default()
        };
        let config = ServerConfig::load(Some(file.path()), overrides).unwrap();
        assert_eq!(config.listen_addr.port(), 5000);
        assert_eq!(config.rpc_timeout, Duration::from_secs(60));
    }

    #[test]
    fn require_token_needs_secret() {
        let overrides = ConfigOverrides {
            require_token: true,
            ..Default::default()
        };
        assert!(ServerConfig::load(None, overrides).is_err());
    }

    #[test]
    fn bad_hex_secret_rejected() {
        let overrides = ConfigOverrides {
            token_secret: Some("not-hex".into()),
            ..Default::default()
        };
        assert!(ServerConfig::load(None, overrides).is_err());
    }
}
