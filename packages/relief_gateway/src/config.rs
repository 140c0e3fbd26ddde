use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / gateway.toml / env vars)
// =============================================================================
//
// Equivalent ways to configure:
//
//   gateway.toml:    [websocket]
//                    ping_interval_secs = 10
//
//   env var:         GATEWAY_WEBSOCKET__PING_INTERVAL_SECS=10   (double underscore = nesting)
//
// Plus the three platform-level variables shared with the other services:
//   PORT, FRONTEND_URL, GATEWAY_MODE

/// Origins admitted regardless of configuration.
pub const STATIC_ALLOWED_ORIGINS: &[&str] = &["http://localhost:3000", "http://localhost:5173"];

/// Development mode exposes failure details in error bodies.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Development,
    Production,
}

impl Mode {
    pub fn is_development(self) -> bool {
        self == Mode::Development
    }
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub cors: CorsFileConfig,
    #[serde(default)]
    pub websocket: WebSocketFileConfig,
    #[serde(default)]
    pub shutdown: ShutdownFileConfig,
}

/// Listener tunables (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit_kb")]
    pub body_limit_kb: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_kb: default_body_limit_kb(),
        }
    }
}

/// Origin tunables (lives under `[cors]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CorsFileConfig {
    /// The single extra origin admitted on top of the static entries.
    #[serde(default)]
    pub frontend_url: Option<String>,
}

/// Persistent-connection tunables (lives under `[websocket]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketFileConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
}

impl Default for WebSocketFileConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            send_channel_capacity: default_send_channel_capacity(),
        }
    }
}

/// Shutdown tunables (lives under `[shutdown]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShutdownFileConfig {
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl Default for ShutdownFileConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_body_limit_kb() -> usize {
    10 * 1024
}
fn default_ping_interval_secs() -> u64 {
    25
}
fn default_ping_timeout_secs() -> u64 {
    60
}
fn default_send_channel_capacity() -> usize {
    100
}
fn default_grace_period_secs() -> u64 {
    10
}

/// Build a figment that layers: defaults → config file → GATEWAY_* env vars →
/// platform variables (PORT, FRONTEND_URL).
///
/// Env vars use double-underscore for nesting into sections:
///   `GATEWAY_SERVER__PORT=8080`  →  `server.port = 8080`
///   `GATEWAY_MODE=production`    →  `mode = "production"`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("GATEWAY_").split("__"))
        .merge(Env::raw().only(&["PORT"]).map(|_| "server.port".into()))
        .merge(
            Env::raw()
                .only(&["FRONTEND_URL"])
                .map(|_| "cors.frontend_url".into()),
        )
}

/// Overrides supplied on the command line; applied after figment extraction.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub development: bool,
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the gateway)
// =============================================================================

/// Resolved gateway configuration.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub mode: Mode,
    pub listen_addr: SocketAddr,
    /// Maximum buffered request body in bytes
    pub body_limit_bytes: usize,
    /// Ordered, de-duplicated allow-list
    pub allowed_origins: Vec<String>,
    pub websocket: WebSocketConfig,
    /// Upper bound on the Draining phase
    pub grace_period: Duration,
}

#[derive(Clone, Debug)]
pub struct WebSocketConfig {
    /// Interval between server pings
    pub ping_interval: Duration,
    /// Extra time allowed after a missed ping before the session is dropped
    pub ping_timeout: Duration,
    /// Outbound queue depth per session
    pub send_channel_capacity: usize,
}

impl WebSocketConfig {
    /// Silence window after which a session is considered dead.
    pub fn idle_deadline(&self) -> Duration {
        self.ping_interval + self.ping_timeout
    }
}

impl GatewayConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let listen_addr = format!("{}:{}", fc.server.host, fc.server.port)
            .parse::<SocketAddr>()
            .with_context(|| {
                format!(
                    "Invalid listen address: {}:{}",
                    fc.server.host, fc.server.port
                )
            })?;

        Ok(Self {
            mode: fc.mode,
            listen_addr,
            body_limit_bytes: fc.server.body_limit_kb * 1024,
            allowed_origins: build_allow_list(fc.cors.frontend_url.as_deref()),
            websocket: WebSocketConfig {
                ping_interval: Duration::from_secs(fc.websocket.ping_interval_secs.max(1)),
                ping_timeout: Duration::from_secs(fc.websocket.ping_timeout_secs),
                send_channel_capacity: fc.websocket.send_channel_capacity.max(1),
            },
            grace_period: Duration::from_secs(fc.shutdown.grace_period_secs),
        })
    }

    /// Extract the layered figment and apply command-line overrides.
    pub fn load(config_path: &Path, overrides: &CliOverrides) -> Result<Self> {
        let mut fc: FileConfig = load_config(config_path)
            .extract()
            .context("Failed to load gateway configuration")?;
        if let Some(host) = &overrides.host {
            fc.server.host = host.clone();
        }
        if let Some(port) = overrides.port {
            fc.server.port = port;
        }
        if overrides.development {
            fc.mode = Mode::Development;
        }
        Self::from_file(&fc)
    }
}

/// Static entries first, then the configured extra origin; empty values and
/// duplicates are dropped.
pub fn build_allow_list(extra: Option<&str>) -> Vec<String> {
    let mut origins: Vec<String> = Vec::new();
    let candidates = STATIC_ALLOWED_ORIGINS
        .iter()
        .copied()
        .chain(extra.map(str::trim));
    for origin in candidates {
        if !origin.is_empty() && !origins.iter().any(|o| o == origin) {
            origins.push(origin.to_string());
        }
    }
    origins
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_server_file_config_defaults() {
        let d = ServerFileConfig::default();
        assert_eq!(d.host, "0.0.0.0");
        assert_eq!(d.port, 5000);
        assert_eq!(d.body_limit_kb, 10 * 1024);
    }

    #[test]
    fn test_websocket_file_config_defaults() {
        let d = WebSocketFileConfig::default();
        assert_eq!(d.ping_interval_secs, 25);
        assert_eq!(d.ping_timeout_secs, 60);
        assert_eq!(d.send_channel_capacity, 100);
    }

    #[test]
    fn test_default_mode_is_development() {
        assert_eq!(FileConfig::default().mode, Mode::Development);
        assert!(Mode::Development.is_development());
        assert!(!Mode::Production.is_development());
    }

    // ── allow-list ──────────────────────────────────────────────────────

    #[test]
    fn test_allow_list_static_only() {
        assert_eq!(
            build_allow_list(None),
            vec!["http://localhost:3000", "http://localhost:5173"]
        );
    }

    #[test]
    fn test_allow_list_appends_frontend_url() {
        let list = build_allow_list(Some("https://relief.example.org"));
        assert_eq!(list.len(), 3);
        assert_eq!(list[2], "https://relief.example.org");
    }

    #[test]
    fn test_allow_list_drops_empty_and_duplicates() {
        assert_eq!(build_allow_list(Some("")).len(), 2);
        assert_eq!(build_allow_list(Some("  ")).len(), 2);
        assert_eq!(build_allow_list(Some("http://localhost:3000")).len(), 2);
    }

    // ── GatewayConfig::from_file ────────────────────────────────────────

    #[test]
    fn test_gateway_config_from_defaults() {
        let gc = GatewayConfig::from_file(&FileConfig::default()).unwrap();
        assert_eq!(gc.listen_addr.port(), 5000);
        assert_eq!(gc.body_limit_bytes, 10 * 1024 * 1024);
        assert_eq!(gc.websocket.idle_deadline(), Duration::from_secs(85));
        assert_eq!(gc.grace_period, Duration::from_secs(10));
    }

    #[test]
    fn test_gateway_config_rejects_bad_host() {
        let mut fc = FileConfig::default();
        fc.server.host = "not a host".into();
        assert!(GatewayConfig::from_file(&fc).is_err());
    }

    #[test]
    fn test_zero_ping_interval_is_clamped() {
        let mut fc = FileConfig::default();
        fc.websocket.ping_interval_secs = 0;
        let gc = GatewayConfig::from_file(&fc).unwrap();
        assert_eq!(gc.websocket.ping_interval, Duration::from_secs(1));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(&tmp.path().join("gateway.toml"))
            .extract()
            .unwrap();
        assert_eq!(fc.server.body_limit_kb, 10 * 1024);
        assert_eq!(fc.websocket.ping_timeout_secs, 60);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gateway.toml");
        std::fs::write(
            &path,
            "mode = \"production\"\n\n[server]\nbody_limit_kb = 64\n\n[cors]\nfrontend_url = \"https://ops.example.org\"\n\n[shutdown]\ngrace_period_secs = 3\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(&path).extract().unwrap();
        assert_eq!(fc.mode, Mode::Production);
        assert_eq!(fc.server.body_limit_kb, 64);
        assert_eq!(
            fc.cors.frontend_url.as_deref(),
            Some("https://ops.example.org")
        );
        assert_eq!(fc.shutdown.grace_period_secs, 3);
    }

    #[test]
    fn test_cli_overrides_win() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gateway.toml");
        std::fs::write(&path, "mode = \"production\"\n[server]\nport = 8088\n").unwrap();
        let overrides = CliOverrides {
            host: Some("127.0.0.1".into()),
            port: Some(0),
            development: true,
        };
        let gc = GatewayConfig::load(&path, &overrides).unwrap();
        assert_eq!(gc.listen_addr, "127.0.0.1:0".parse::<SocketAddr>().unwrap());
        assert_eq!(gc.mode, Mode::Development);
    }
}
