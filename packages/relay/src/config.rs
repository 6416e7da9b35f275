use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Port used when neither `PORT`, config file, nor CLI picks one.
pub const DEFAULT_PORT: u16 = 8080;

// =============================================================================
// File config (figment-deserialized from defaults / relay.toml / env vars)
// =============================================================================
//
// Equivalent ways to configure:
//
//   relay.toml:      [server]
//                    idle_timeout_secs = 60
//
//   env var:         RELAY_SERVER__IDLE_TIMEOUT_SECS=60   (double underscore = nesting)
//
//   port only:       PORT=9000   (bare, for platform-assigned ports)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
}

/// Server tuning knobs (lives under `[server]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Outbound frames buffered per connection before new ones are dropped
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    /// Larger text frames close the sender's connection unrelayed
    #[serde(default = "default_max_message_kb")]
    pub max_message_kb: usize,
    /// Raised to 1 if set to 0
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// 0 disables the idle timeout
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 0 disables server pings
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            send_queue_capacity: default_send_queue_capacity(),
            max_message_kb: default_max_message_kb(),
            write_timeout_secs: default_write_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_send_queue_capacity() -> usize {
    64
}
fn default_max_message_kb() -> usize {
    4096
}
fn default_write_timeout_secs() -> u64 {
    10
}
fn default_idle_timeout_secs() -> u64 {
    120
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}

/// Build a figment that layers: defaults → relay.toml → RELAY_* env vars → PORT.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_SERVER__PORT=9000`  →  `server.port = 9000`
///
/// The bare `PORT` variable wins over everything except CLI flags, which the
/// caller merges on top.
pub fn load_config(config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment
        .merge(Env::prefixed("RELAY_").split("__"))
        .merge(Env::raw().only(&["PORT"]).map(|_| "server.port".into()))
}

/// CLI values that override the figment layers.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Resolve the final `FileConfig` from all layers plus CLI overrides.
pub fn resolve(config_file: Option<&Path>, cli: CliOverrides) -> Result<FileConfig> {
    use figment::providers::Serialized;

    load_config(config_file)
        .merge(Serialized::default("server", cli))
        .extract()
        .context("Invalid relay configuration")
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the server)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub websocket: WebSocketConfig,
}

#[derive(Clone, Debug)]
pub struct WebSocketConfig {
    pub send_queue_capacity: usize,
    pub max_message_bytes: usize,
    pub write_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub heartbeat_interval: Option<Duration>,
}

impl RelayConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let server = &fc.server;
        let ip: IpAddr = server
            .host
            .parse()
            .with_context(|| format!("Invalid bind host: {}", server.host))?;

        Ok(Self {
            bind_addr: SocketAddr::new(ip, server.port),
            websocket: WebSocketConfig::from_file(server),
        })
    }
}

impl WebSocketConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            // mpsc::channel panics on zero capacity
            send_queue_capacity: fc.send_queue_capacity.max(1),
            max_message_bytes: fc.max_message_kb.saturating_mul(1024),
            // A zero write timeout would fail every write that is not ready at once
            write_timeout: Duration::from_secs(fc.write_timeout_secs.max(1)),
            idle_timeout: non_zero_secs(fc.idle_timeout_secs),
            heartbeat_interval: non_zero_secs(fc.heartbeat_interval_secs),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::from_file(&ServerFileConfig::default())
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_server_file_config_defaults() {
        let d = ServerFileConfig::default();
        assert_eq!(d.host, "0.0.0.0");
        assert_eq!(d.port, 8080);
        assert_eq!(d.send_queue_capacity, 64);
        assert_eq!(d.max_message_kb, 4096);
        assert_eq!(d.write_timeout_secs, 10);
        assert_eq!(d.idle_timeout_secs, 120);
        assert_eq!(d.heartbeat_interval_secs, 30);
    }

    // ── RelayConfig::from_file ──────────────────────────────────────────

    #[test]
    fn test_relay_config_from_defaults() {
        let rc = RelayConfig::from_file(&FileConfig::default()).unwrap();
        assert_eq!(rc.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(rc.websocket.max_message_bytes, 4 * 1024 * 1024);
        assert_eq!(rc.websocket.write_timeout, Duration::from_secs(10));
        assert_eq!(rc.websocket.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(
            rc.websocket.heartbeat_interval,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_zero_timeouts_disable() {
        let fc = ServerFileConfig {
            idle_timeout_secs: 0,
            heartbeat_interval_secs: 0,
            send_queue_capacity: 0,
            ..Default::default()
        };
        let ws = WebSocketConfig::from_file(&fc);
        assert!(ws.idle_timeout.is_none());
        assert!(ws.heartbeat_interval.is_none());
        assert_eq!(ws.send_queue_capacity, 1);
    }

    #[test]
    fn test_zero_write_timeout_clamped() {
        let fc = ServerFileConfig {
            write_timeout_secs: 0,
            ..Default::default()
        };
        let ws = WebSocketConfig::from_file(&fc);
        assert_eq!(ws.write_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_huge_message_limit_saturates() {
        let fc = ServerFileConfig {
            max_message_kb: usize::MAX,
            ..Default::default()
        };
        let ws = WebSocketConfig::from_file(&fc);
        assert_eq!(ws.max_message_bytes, usize::MAX);
    }

    #[test]
    fn test_invalid_host_rejected() {
        let fc = FileConfig {
            server: ServerFileConfig {
                host: "not-an-ip".to_string(),
                ..Default::default()
            },
        };
        assert!(RelayConfig::from_file(&fc).is_err());
    }

    // ── layering ────────────────────────────────────────────────────────

    #[test]
    fn test_port_falls_back_to_default() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let fc = resolve(None, CliOverrides::default()).unwrap();
            assert_eq!(fc.server.port, DEFAULT_PORT);
            Ok(())
        });
    }

    #[test]
    fn test_port_env_var() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("PORT", "9123");
            let fc = resolve(None, CliOverrides::default()).unwrap();
            assert_eq!(fc.server.port, 9123);
            Ok(())
        });
    }

    #[test]
    fn test_prefixed_env_nesting() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("RELAY_SERVER__IDLE_TIMEOUT_SECS", "5");
            let fc = resolve(None, CliOverrides::default()).unwrap();
            assert_eq!(fc.server.idle_timeout_secs, 5);
            Ok(())
        });
    }

    #[test]
    fn test_toml_file_sets_values() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "relay.toml",
                "[server]\nhost = \"127.0.0.1\"\nport = 7000\nsend_queue_capacity = 8\n",
            )?;
            let fc = resolve(Some(Path::new("relay.toml")), CliOverrides::default()).unwrap();
            assert_eq!(fc.server.host, "127.0.0.1");
            assert_eq!(fc.server.port, 7000);
            assert_eq!(fc.server.send_queue_capacity, 8);
            Ok(())
        });
    }

    #[test]
    fn test_port_env_overrides_toml() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("relay.toml", "[server]\nport = 7000\n")?;
            jail.set_env("PORT", "7001");
            let fc = resolve(Some(Path::new("relay.toml")), CliOverrides::default()).unwrap();
            assert_eq!(fc.server.port, 7001);
            Ok(())
        });
    }

    #[test]
    fn test_cli_overrides_everything() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("PORT", "7001");
            let cli = CliOverrides {
                host: Some("127.0.0.1".to_string()),
                port: Some(7002),
            };
            let fc = resolve(None, cli).unwrap();
            assert_eq!(fc.server.port, 7002);
            assert_eq!(fc.server.host, "127.0.0.1");
            Ok(())
        });
    }

    #[test]
    fn test_missing_config_file_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(Some(&tmp.path().join("absent.toml")))
            .extract()
            .unwrap();
        assert_eq!(fc.server.send_queue_capacity, 64);
    }
}
