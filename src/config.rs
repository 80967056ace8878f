//! Configuration loading and defaults.
//!
//! ## Relay server
//!
//! Resolved in order of precedence (highest wins):
//!
//! 1. **CLI flags** — `--internal-addr`, `--public-addr`, `--idle-timeout`
//! 2. **Environment variables** — `RELAYTUN_INTERNAL_LISTEN`,
//!    `RELAYTUN_PUBLIC_LISTEN`, `RELAYTUN_IDLE_TIMEOUT_SECS`
//! 3. **Config file** — path via `--config <path>`, or `relaytun.toml` in CWD
//! 4. **Compiled defaults** — see each field's default value below
//!
//! ```toml
//! [server]
//! internal_listen = "0.0.0.0:8080"   # control plane: /connect, /close, /ws
//! public_listen = "0.0.0.0:8081"     # public plane: <id>.<domain>
//! idle_timeout_secs = 0              # 0 disables the idle reaper
//! reap_interval_secs = 60
//! proxy_timeout_secs = 30
//! max_body_bytes = 10485760          # 10 MB
//!
//! [logging]
//! level = "info"
//! ```
//!
//! ## Agent
//!
//! `~/.relaytun.toml` < `RELAYTUN_*` environment < explicit flags.
//!
//! ```toml
//! endpoint = "relay.example.com:8080"
//! insecure = false
//! port = 3000
//! domain = "tunnels.example.com"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::Deserialize;

/// Top-level relay configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener addresses and tunnel policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Control-plane bind address (default `0.0.0.0:8080`).
    #[serde(default = "default_internal_listen")]
    pub internal_listen: String,
    /// Public-plane bind address (default `0.0.0.0:8081`).
    #[serde(default = "default_public_listen")]
    pub public_listen: String,
    /// Evict tunnels idle this long. `0` disables eviction (default).
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Seconds between idle sweeps (default 60).
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
    /// How long a multiplexed request waits for its agent (default 30).
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,
    /// Largest request body forwarded over a multiplexed session (default 10 MB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_internal_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_public_listen() -> String {
    "0.0.0.0:8081".to_string()
}
fn default_reap_interval() -> u64 {
    60
}
fn default_proxy_timeout() -> u64 {
    30
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            internal_listen: default_internal_listen(),
            public_listen: default_public_listen(),
            idle_timeout_secs: 0,
            reap_interval_secs: default_reap_interval(),
            proxy_timeout_secs: default_proxy_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_secs)
    }
}

impl Config {
    /// Load the relay configuration: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `relaytun.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(p))?
        } else if Path::new("relaytun.toml").exists() {
            Self::from_file(Path::new("relaytun.toml"))?
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {}: {e}", path.display()))
    }

    /// Env var overrides. `lookup` is `std::env::var` outside of tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("RELAYTUN_INTERNAL_LISTEN") {
            self.server.internal_listen = listen;
        }
        if let Some(listen) = lookup("RELAYTUN_PUBLIC_LISTEN") {
            self.server.public_listen = listen;
        }
        if let Some(secs) = lookup("RELAYTUN_IDLE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.server.idle_timeout_secs = secs;
        }
    }
}

/// How the agent delivers traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Register over HTTP; the relay dials the advertised address itself.
    #[default]
    Direct,
    /// Hold a WebSocket to the relay and answer multiplexed requests.
    Ws,
}

/// Agent settings after merging file, environment, and flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Relay control-plane `host:port`, without scheme.
    pub endpoint: String,
    /// Use `http`/`ws` instead of `https`/`wss`.
    pub insecure: bool,
    /// Explicit tunnel ID; `None` lets the relay pick one.
    pub id: Option<String>,
    /// Address advertised for direct-proxy delivery.
    pub ip: String,
    /// Local service port.
    pub port: u16,
    pub domain: Option<String>,
    /// Run a TCP relay on this port and advertise it instead of `port`.
    pub proxy_port: Option<u16>,
    pub mode: AgentMode,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: "localhost:8080".to_string(),
            insecure: false,
            id: None,
            ip: String::new(),
            port: 3000,
            domain: Some("localhost".to_string()),
            proxy_port: None,
            mode: AgentMode::Direct,
        }
    }
}

/// On-disk agent defaults; every key is optional.
#[derive(Debug, Default, Deserialize)]
pub struct AgentFile {
    pub endpoint: Option<String>,
    pub insecure: Option<bool>,
    pub id: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub domain: Option<String>,
    pub proxy_port: Option<u16>,
    pub mode: Option<AgentMode>,
}

/// `$HOME/.relaytun.toml`, if `HOME` is set.
pub fn agent_config_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".relaytun.toml"))
}

impl AgentConfig {
    /// Defaults, then `~/.relaytun.toml`, then `RELAYTUN_*` env vars.
    /// A missing file is fine; an unreadable or invalid one is an error.
    pub fn load() -> Result<Self, String> {
        let mut config = Self::default();
        if let Some(path) = agent_config_path().filter(|p| p.exists()) {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
            let file: AgentFile = toml::from_str(&content)
                .map_err(|e| format!("Failed to parse {}: {e}", path.display()))?;
            config.merge_file(file);
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn merge_file(&mut self, file: AgentFile) {
        if let Some(endpoint) = file.endpoint.filter(|s| !s.is_empty()) {
            self.endpoint = endpoint;
        }
        if file.insecure == Some(true) {
            self.insecure = true;
        }
        if let Some(id) = file.id.filter(|s| !s.is_empty()) {
            self.id = Some(id);
        }
        if let Some(ip) = file.ip.filter(|s| !s.is_empty()) {
            self.ip = ip;
        }
        if let Some(port) = file.port.filter(|p| *p != 0) {
            self.port = port;
        }
        if let Some(domain) = file.domain.filter(|s| !s.is_empty()) {
            self.domain = Some(domain);
        }
        if let Some(proxy_port) = file.proxy_port.filter(|p| *p != 0) {
            self.proxy_port = Some(proxy_port);
        }
        if let Some(mode) = file.mode {
            self.mode = mode;
        }
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if lookup("RELAYTUN_INSECURE").as_deref() == Some("true") {
            self.insecure = true;
        }
        if let Some(endpoint) = lookup("RELAYTUN_ENDPOINT").filter(|s| !s.is_empty()) {
            self.endpoint = endpoint;
        }
        if let Some(port) = lookup("RELAYTUN_PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(e) => tracing::warn!(value = %port, "Ignoring RELAYTUN_PORT: {e}"),
            }
        }
        if let Some(domain) = lookup("RELAYTUN_DOMAIN").filter(|s| !s.is_empty()) {
            self.domain = Some(domain);
        }
    }

    /// `http` or `https` for control-plane calls and the printed endpoint.
    pub fn http_scheme(&self) -> &'static str {
        if self.insecure {
            "http"
        } else {
            "https"
        }
    }

    pub fn ws_scheme(&self) -> &'static str {
        if self.insecure {
            "ws"
        } else {
            "wss"
        }
    }

    /// Port the relay should dial: the TCP relay's when one runs.
    pub fn advertised_port(&self) -> u16 {
        self.proxy_port.unwrap_or(self.port)
    }
}
