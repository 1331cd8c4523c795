//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `HTTPTUN_AUTH_TOKEN`, `HTTPTUN_LISTEN`
//! 2. **Config file**: path via `--config <path>`, or `httptun.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! max_buffer_bytes = 1048576       # pause destination reads above this (1 MB)
//! max_request_bytes = 16777216     # PUT body limit (16 MB)
//! connect_timeout_secs = 30
//! close_grace_secs = 10            # wait this long for queued writes on DELETE
//! inactivity_timeout_secs = 3600   # sweep tunnels idle for an hour
//! sweep_interval_secs = 300        # ... checked every 5 minutes
//! drain_policy = "acknowledged"    # or "pending"
//! default_destination = "db.internal:5432"  # used when POST /tunnels has no body
//!
//! [auth]
//! token = "your-secret-token"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::tunnel::DrainPolicy;

/// Name of the config file looked up in the working directory.
const DEFAULT_CONFIG_FILE: &str = "httptun.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener, buffering and sweep settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Undelivered outbound bytes per tunnel before destination reads pause (default 1 MB).
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
    /// Largest accepted PUT body in bytes (default 16 MB).
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    /// Seconds to wait for a destination TCP connect (default 30).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Seconds a closing tunnel may spend flushing queued writes to a
    /// destination that stopped reading before it is cut off (default 10).
    #[serde(default = "default_close_grace_secs")]
    pub close_grace_secs: u64,
    /// Seconds without GET/PUT before the sweep closes a tunnel (default 3600).
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    /// Seconds between inactivity sweeps (default 300).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// When a tunnel whose destination closed is removed.
    #[serde(default)]
    pub drain_policy: DrainPolicy,
    /// `host:port` used when `POST /tunnels` carries no body.
    pub default_destination: Option<String>,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Value every request must carry in its `Auth-Token` header. Override
    /// with `HTTPTUN_AUTH_TOKEN`. Defaults to `"change-me"`, which triggers a
    /// startup warning.
    #[serde(default = "default_token")]
    pub token: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_max_buffer_bytes() -> usize {
    1024 * 1024 // 1 MB
}
fn default_max_request_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_close_grace_secs() -> u64 {
    10
}
fn default_inactivity_timeout_secs() -> u64 {
    3600
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_token() -> String {
    "change-me".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_buffer_bytes: default_max_buffer_bytes(),
            max_request_bytes: default_max_request_bytes(),
            connect_timeout_secs: default_connect_timeout_secs(),
            close_grace_secs: default_close_grace_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            drain_policy: DrainPolicy::default(),
            default_destination: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: default_token(),
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
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Split `default_destination` into host and port.
    pub fn default_destination(&self) -> Result<Option<(String, u16)>, ConfigError> {
        self.default_destination
            .as_deref()
            .map(parse_host_port)
            .transpose()
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("server.connect_timeout_secs", self.connect_timeout_secs),
            ("server.inactivity_timeout_secs", self.inactivity_timeout_secs),
            ("server.sweep_interval_secs", self.sweep_interval_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        self.default_destination()?;
        Ok(())
    }
}

/// Parse `host:port`, accepting bracketed IPv6 hosts.
fn parse_host_port(s: &str) -> Result<(String, u16), ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        field: "server.default_destination",
        reason: format!("{reason}: {s}"),
    };
    let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
    Ok((host.to_string(), port))
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `httptun.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Config::default(),
        };

        // Env var overrides
        if let Ok(token) = std::env::var("HTTPTUN_AUTH_TOKEN") {
            config.auth.token = token;
        }
        if let Ok(listen) = std::env::var("HTTPTUN_LISTEN") {
            config.server.listen = listen;
        }

        config.server.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}
