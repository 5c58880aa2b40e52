//! Server configuration: TOML file + CLI overrides.

use crate::connection::{ConnectionSettings, DEFAULT_QUEUE_CAPACITY};
use parley_core::protocol::{self, CLOSE_GRACE};
use parley_core::{ParleyError, ParleyResult};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub ws: WsSection,
    #[serde(default)]
    pub grpc: GrpcSection,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[ws]` section: the WebSocket listener.
#[derive(Debug, Clone, Deserialize)]
pub struct WsSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_ws_port")]
    pub port: u16,
    /// Maximum concurrent connections.
    #[serde(default = "default_max_connections")]
    pub conn: usize,
}

impl Default for WsSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_ws_port(),
            conn: default_max_connections(),
        }
    }
}

/// `[grpc]` section. Only parsed and reported; no listener is started for it.
#[derive(Debug, Clone, Deserialize)]
pub struct GrpcSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_grpc_port")]
    pub port: u16,
}

impl Default for GrpcSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_grpc_port(),
        }
    }
}

/// `[relay]` section: keepalive, framing and backpressure knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            peer_timeout_secs: default_peer_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            queue_capacity: default_queue_capacity(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_ws_port() -> u16 {
    8000
}
fn default_grpc_port() -> u16 {
    9000
}
fn default_max_connections() -> usize {
    1024
}
fn default_peer_timeout_secs() -> u64 {
    protocol::DEFAULT_PEER_TIMEOUT.as_secs()
}
fn default_write_timeout_secs() -> u64 {
    protocol::DEFAULT_WRITE_TIMEOUT.as_secs()
}
fn default_max_frame_bytes() -> usize {
    protocol::DEFAULT_MAX_FRAME_SIZE
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_enqueue_timeout_ms() -> u64 {
    2000
}

/// Upper bound for every configured timeout.
const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
}

/// Resolved server configuration (CLI overrides applied, durations built).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub grpc_host: String,
    pub grpc_port: u16,
    pub connection: ConnectionSettings,
    /// How long the router waits for space in a full receiver queue.
    pub enqueue_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_ws_port(),
            max_connections: default_max_connections(),
            grpc_host: default_host(),
            grpc_port: default_grpc_port(),
            connection: ConnectionSettings::default(),
            enqueue_timeout: Duration::from_millis(default_enqueue_timeout_ms()),
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error: every section falls back to defaults.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> ParleyResult<Self> {
        let file_config = match config_path.map(expand_tilde) {
            Some(expanded) if expanded.exists() => {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| ParleyError::Config(format!("config parse error: {e}")))?
            }
            Some(expanded) => {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    fn resolve(file: ConfigFile, overrides: Overrides) -> ParleyResult<Self> {
        let relay = file.relay;
        if relay.peer_timeout_secs == 0 {
            return Err(ParleyError::Config("relay.peer_timeout_secs must be > 0".into()));
        }
        if relay.peer_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(ParleyError::Config(format!(
                "relay.peer_timeout_secs must be <= {MAX_TIMEOUT_SECS}"
            )));
        }
        if relay.write_timeout_secs == 0 {
            return Err(ParleyError::Config("relay.write_timeout_secs must be > 0".into()));
        }
        if relay.write_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(ParleyError::Config(format!(
                "relay.write_timeout_secs must be <= {MAX_TIMEOUT_SECS}"
            )));
        }
        if relay.enqueue_timeout_ms > MAX_TIMEOUT_SECS * 1000 {
            return Err(ParleyError::Config(format!(
                "relay.enqueue_timeout_ms must be <= {}",
                MAX_TIMEOUT_SECS * 1000
            )));
        }
        if relay.queue_capacity == 0 {
            return Err(ParleyError::Config("relay.queue_capacity must be > 0".into()));
        }
        if relay.max_frame_bytes == 0 {
            return Err(ParleyError::Config("relay.max_frame_bytes must be > 0".into()));
        }

        let max_connections = overrides.max_connections.unwrap_or(file.ws.conn);
        if max_connections == 0 {
            return Err(ParleyError::Config("ws.conn must be > 0".into()));
        }

        let peer_timeout = Duration::from_secs(relay.peer_timeout_secs);
        Ok(Self {
            host: overrides.host.unwrap_or(file.ws.host),
            port: overrides.port.unwrap_or(file.ws.port),
            max_connections,
            grpc_host: file.grpc.host,
            grpc_port: file.grpc.port,
            connection: ConnectionSettings {
                peer_timeout,
                ping_period: protocol::ping_period(peer_timeout),
                write_timeout: Duration::from_secs(relay.write_timeout_secs),
                close_grace: CLOSE_GRACE,
                max_frame_size: relay.max_frame_bytes,
                queue_capacity: relay.queue_capacity,
            },
            enqueue_timeout: Duration::from_millis(relay.enqueue_timeout_ms),
        })
    }

    /// `host:port` of the WebSocket listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ws.host={}, ws.port={}, ws.conn={}, grpc.host={}, grpc.port={}, peer_timeout={:?}, queue={}",
            self.host,
            self.port,
            self.max_connections,
            self.grpc_host,
            self.grpc_port,
            self.connection.peer_timeout,
            self.connection.queue_capacity,
        )
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

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = ServerConfig::load(
            Some(Path::new("/definitely/not/here/configs.toml")),
            Overrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.max_connections, 1024);
        assert_eq!(cfg.connection.peer_timeout, Duration::from_secs(60));
        assert_eq!(cfg.connection.ping_period, Duration::from_secs(54));
        assert_eq!(cfg.connection.write_timeout, Duration::from_secs(10));
        assert_eq!(cfg.connection.max_frame_size, 4096);
    }

    #[test]
    fn file_values_and_partial_sections() {
        let file = write_config(
            r#"
            [ws]
            host = "127.0.0.1"
            port = 8100
            conn = 10

            [grpc]
            port = 9100

            [relay]
            peer_timeout_secs = 20
            "#,
        );
        let cfg = ServerConfig::load(Some(file.path()), Overrides::default()).unwrap();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:8100");
        assert_eq!(cfg.max_connections, 10);
        assert_eq!(cfg.grpc_host, "0.0.0.0");
        assert_eq!(cfg.grpc_port, 9100);
        assert_eq!(cfg.connection.ping_period, Duration::from_secs(18));
        assert_eq!(cfg.connection.queue_capacity, 256);
    }

    #[test]
    fn cli_overrides_win() {
        let file = write_config("[ws]\nport = 8100\nconn = 10\n");
        let cfg = ServerConfig::load(
            Some(file.path()),
            Overrides {
                host: Some("localhost".into()),
                port: Some(8200),
                max_connections: Some(5),
            },
        )
        .unwrap();
        assert_eq!(cfg.listen_addr(), "localhost:8200");
        assert_eq!(cfg.max_connections, 5);
    }

    #[test]
    fn invalid_values_rejected() {
        let file = write_config("[relay]\nqueue_capacity = 0\n");
        assert!(matches!(
            ServerConfig::load(Some(file.path()), Overrides::default()),
            Err(ParleyError::Config(_))
        ));

        let file = write_config("[ws\nport = ");
        assert!(ServerConfig::load(Some(file.path()), Overrides::default()).is_err());
    }

    #[test]
    fn oversized_timeouts_rejected() {
        for body in [
            "[relay]\npeer_timeout_secs = 9223372036854775807\n",
            "[relay]\npeer_timeout_secs = 86401\n",
            "[relay]\nwrite_timeout_secs = 18446744073709551615\n",
            "[relay]\nenqueue_timeout_ms = 86400001\n",
        ] {
            let file = write_config(body);
            assert!(
                matches!(
                    ServerConfig::load(Some(file.path()), Overrides::default()),
                    Err(ParleyError::Config(_))
                ),
                "accepted: {body}"
            );
        }

        let file = write_config("[relay]\npeer_timeout_secs = 86400\n");
        let cfg = ServerConfig::load(Some(file.path()), Overrides::default()).unwrap();
        assert_eq!(cfg.connection.peer_timeout, Duration::from_secs(86_400));
    }

    #[test]
    fn display_summary() {
        let summary = ServerConfig::default().to_string();
        assert!(summary.starts_with("ws.host=0.0.0.0, ws.port=8000, ws.conn=1024"));
        assert!(summary.contains("grpc.port=9000"));
    }
}
