//! Configuration types for both endpoints
//!
//! Configuration is plain serde-backed structs with builder-style setters,
//! a `validate()` pass, and environment-variable overrides applied on top
//! of whatever the binary parsed from flags or a JSON file. Environment
//! variables use the `DNSPIPE_` prefix.
//!
//! # Example
//!
//! ```
//! use dnspipe::config::ServerConfig;
//!
//! let config = ServerConfig::new("tunnel.example.com.", "10.0.0.1", 5222)
//!     .with_listen(":5353");
//! config.validate().expect("valid config");
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TunnelError, TunnelResult};

/// Default local SOCKS5 port.
pub const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Default server listen address (UDP).
pub const DEFAULT_LISTEN: &str = ":53";

/// Default downstream poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default DNS exchange timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 2;

/// Default idle deadline after which a session is destroyed, in seconds.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// Default reaper scan cadence in seconds.
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 10;

/// Logging configuration shared by both binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Client endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Recursive DNS server address ("1.1.1.1:53"); empty means discover
    /// via the host resolver configuration with an `8.8.8.8:53` fallback.
    #[serde(default)]
    pub dns_server: String,
    /// Zone the tunnel server is authoritative for; must end in `.`.
    pub zone: String,
    /// Local SOCKS5 listen port; 0 lets the OS pick one.
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    /// Downstream poll interval in milliseconds (50–100 is sensible).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// DNS exchange timeout in seconds.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
}

fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_query_timeout_secs() -> u64 {
    DEFAULT_QUERY_TIMEOUT_SECS
}

impl ClientConfig {
    /// Load a client configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] if the file cannot be read or
    /// parsed, or fails validation.
    pub fn load(path: impl AsRef<Path>) -> TunnelResult<Self> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Create a client configuration for the given zone with defaults
    /// everywhere else.
    #[must_use]
    pub fn new(zone: impl Into<String>) -> Self {
        Self {
            dns_server: String::new(),
            zone: zone.into(),
            socks_port: DEFAULT_SOCKS_PORT,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            log: LogConfig::default(),
        }
    }

    /// Set the recursive DNS server address.
    #[must_use]
    pub fn with_dns_server(mut self, dns_server: impl Into<String>) -> Self {
        self.dns_server = dns_server.into();
        self
    }

    /// Set the local SOCKS5 port.
    #[must_use]
    pub fn with_socks_port(mut self, port: u16) -> Self {
        self.socks_port = port;
        self
    }

    /// Set the downstream poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// The poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The DNS exchange timeout as a [`Duration`].
    #[must_use]
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Apply `DNSPIPE_*` environment overrides.
    ///
    /// Recognized: `DNSPIPE_DNS_SERVER`, `DNSPIPE_ZONE`,
    /// `DNSPIPE_SOCKS_PORT`, `DNSPIPE_LOG_LEVEL`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] if an override does not parse.
    pub fn apply_env_overrides(&mut self) -> TunnelResult<()> {
        if let Ok(server) = std::env::var("DNSPIPE_DNS_SERVER") {
            self.dns_server = server;
        }
        if let Ok(zone) = std::env::var("DNSPIPE_ZONE") {
            self.zone = zone;
        }
        if let Ok(port) = std::env::var("DNSPIPE_SOCKS_PORT") {
            self.socks_port = port.parse().map_err(|_| {
                TunnelError::config_field(format!("invalid port {port:?}"), "DNSPIPE_SOCKS_PORT")
            })?;
        }
        if let Ok(level) = std::env::var("DNSPIPE_LOG_LEVEL") {
            self.log.level = level;
        }
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] on a missing or unqualified zone,
    /// an unparseable DNS server address, or a zero poll interval.
    pub fn validate(&self) -> TunnelResult<()> {
        validate_zone(&self.zone)?;
        if !self.dns_server.is_empty() {
            self.dns_server.parse::<SocketAddr>().map_err(|_| {
                TunnelError::config_field(
                    format!("invalid DNS server address {:?}", self.dns_server),
                    "dns_server",
                )
            })?;
        }
        if self.poll_interval_ms == 0 {
            return Err(TunnelError::config_field(
                "poll interval must be positive",
                "poll_interval_ms",
            ));
        }
        Ok(())
    }
}

/// Server endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UDP listen address; a bare `:port` binds all interfaces.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Zone this server is authoritative for; must end in `.`.
    pub zone: String,
    /// Upstream target host every session connects to.
    pub target_host: String,
    /// Upstream target port.
    pub target_port: u16,
    /// Idle deadline after which the reaper destroys a session, seconds.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Reaper scan cadence, seconds.
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_session_timeout_secs() -> u64 {
    DEFAULT_SESSION_TIMEOUT_SECS
}

fn default_reaper_interval_secs() -> u64 {
    DEFAULT_REAPER_INTERVAL_SECS
}

impl ServerConfig {
    /// Load a server configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] if the file cannot be read or
    /// parsed, or fails validation.
    pub fn load(path: impl AsRef<Path>) -> TunnelResult<Self> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Create a server configuration with defaults for everything except
    /// the zone and upstream target.
    #[must_use]
    pub fn new(zone: impl Into<String>, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            listen: default_listen(),
            zone: zone.into(),
            target_host: target_host.into(),
            target_port,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            reaper_interval_secs: DEFAULT_REAPER_INTERVAL_SECS,
            log: LogConfig::default(),
        }
    }

    /// Set the listen address.
    #[must_use]
    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    /// Set the session idle timeout.
    #[must_use]
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout_secs = timeout.as_secs();
        self
    }

    /// The upstream target as a `host:port` string.
    #[must_use]
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }

    /// The session idle timeout as a [`Duration`].
    #[must_use]
    pub const fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// The reaper cadence as a [`Duration`].
    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    /// The listen address as a [`SocketAddr`], expanding the bare `:port`
    /// shorthand to all interfaces.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] if the address does not parse.
    pub fn listen_addr(&self) -> TunnelResult<SocketAddr> {
        let addr = if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        };
        addr.parse().map_err(|_| {
            TunnelError::config_field(format!("invalid listen address {:?}", self.listen), "listen")
        })
    }

    /// Apply `DNSPIPE_*` environment overrides.
    ///
    /// Recognized: `DNSPIPE_LISTEN_ADDR`, `DNSPIPE_ZONE`,
    /// `DNSPIPE_TARGET_HOST`, `DNSPIPE_TARGET_PORT`, `DNSPIPE_LOG_LEVEL`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] if an override does not parse.
    pub fn apply_env_overrides(&mut self) -> TunnelResult<()> {
        if let Ok(listen) = std::env::var("DNSPIPE_LISTEN_ADDR") {
            self.listen = listen;
        }
        if let Ok(zone) = std::env::var("DNSPIPE_ZONE") {
            self.zone = zone;
        }
        if let Ok(host) = std::env::var("DNSPIPE_TARGET_HOST") {
            self.target_host = host;
        }
        if let Ok(port) = std::env::var("DNSPIPE_TARGET_PORT") {
            self.target_port = port.parse().map_err(|_| {
                TunnelError::config_field(format!("invalid port {port:?}"), "DNSPIPE_TARGET_PORT")
            })?;
        }
        if let Ok(level) = std::env::var("DNSPIPE_LOG_LEVEL") {
            self.log.level = level;
        }
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] on a missing or unqualified zone,
    /// a bad listen address, or a missing upstream target.
    pub fn validate(&self) -> TunnelResult<()> {
        validate_zone(&self.zone)?;
        self.listen_addr()?;
        if self.target_host.is_empty() {
            return Err(TunnelError::config_field(
                "upstream target host is required",
                "target_host",
            ));
        }
        if self.target_port == 0 {
            return Err(TunnelError::config_field(
                "upstream target port must be positive",
                "target_port",
            ));
        }
        if self.session_timeout_secs == 0 {
            return Err(TunnelError::config_field(
                "session timeout must be positive",
                "session_timeout_secs",
            ));
        }
        Ok(())
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> TunnelResult<T> {
    debug!(path = %path.display(), "loading configuration");
    let contents = std::fs::read_to_string(path).map_err(|e| {
        TunnelError::config(format!("failed to read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&contents).map_err(|e| {
        TunnelError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

fn validate_zone(zone: &str) -> TunnelResult<()> {
    if zone.is_empty() {
        return Err(TunnelError::config_field("zone is required", "zone"));
    }
    if !zone.ends_with('.') {
        return Err(TunnelError::config_field(
            format!("zone {zone:?} must be fully qualified (end in '.')"),
            "zone",
        ));
    }
    Ok(())
}
