//! Configuration loading for httptun-client.
//!
//! Each setting is resolved from the first source that provides it:
//!
//! 1. **Command-line flags** (`--url`, `--token`, ...)
//! 2. **Environment variables**: `HTTPTUN_URL`, `HTTPTUN_AUTH_TOKEN`
//! 3. **TOML file** via `--config <path>`
//! 4. **Compiled defaults**
//!
//! ```toml
//! local_host = "127.0.0.1"
//! local_port = 20000
//! url = "https://tunnel.example.com"   # ws:// or wss:// selects the WebSocket transport
//! token = "your-secret-token"
//! dst_host = "db.internal"             # omit to let the server pick its default
//! dst_port = 5432
//!
//! [retry]
//! max_retries = 10
//! base_delay_ms = 250
//! max_delay_ms = 5000
//! request_timeout_secs = 30    # POST/PUT/DELETE only; GET long-polls without one
//! max_put_bytes = 1048576
//!
//! [logging]
//! level = "error"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// CLI arguments parsed by `clap`.
#[derive(Parser, Debug, Default)]
#[command(
    name = "httptun-client",
    version,
    about = "Forward local TCP connections through an HTTP tunnel server"
)]
pub struct Cli {
    /// Local address to listen on [default: 127.0.0.1]
    #[arg(long)]
    pub local_host: Option<String>,

    /// Local port to listen on [default: 20000]
    #[arg(long, short = 'p')]
    pub local_port: Option<u16>,

    /// Tunnel server URL (http/https for polling, ws/wss for WebSocket)
    #[arg(long, short = 'u', env = "HTTPTUN_URL")]
    pub url: Option<String>,

    /// Destination host the server should connect to
    #[arg(long)]
    pub dst_host: Option<String>,

    /// Destination port the server should connect to
    #[arg(long)]
    pub dst_port: Option<u16>,

    /// Shared token sent as the `Auth-Token` header
    #[arg(long, env = "HTTPTUN_AUTH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Log filter level [default: error]
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Raw TOML config file structure.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    local_host: Option<String>,
    local_port: Option<u16>,
    url: Option<String>,
    token: Option<String>,
    dst_host: Option<String>,
    dst_port: Option<u16>,
    retry: RetryConfig,
    logging: LoggingConfig,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingConfig {
    level: Option<String>,
}

/// Retry and request sizing for the polling transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    /// Consecutive failures of one operation before the tunnel is abandoned (default 10).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff between retries of the same sequence (default 250 ms).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff ceiling (default 5 s).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Per-request timeout for POST, PUT and DELETE (default 30 s).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Largest body sent in a single PUT (default 1 MB).
    #[serde(default = "default_max_put_bytes")]
    pub max_put_bytes: usize,
}

fn default_max_retries() -> u32 {
    10
}
fn default_base_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    5000
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_put_bytes() -> usize {
    1024 * 1024 // 1 MB
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_put_bytes: default_max_put_bytes(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Which wire transport a tunnel URL selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// `http`/`https`: sequenced PUT/GET requests.
    HttpPoll,
    /// `ws`/`wss`: one persistent WebSocket.
    WebSocket,
}

/// A validated tunnel server URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelUrl {
    base: String,
    transport: Transport,
}

impl TunnelUrl {
    /// Trim, default the scheme to `https://`, and pick the transport.
    pub fn parse(raw: &str) -> Result<Self, ClientError> {
        let invalid = |reason: &str| ClientError::InvalidTunnelUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty URL"));
        }
        let candidate = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };

        let url = reqwest::Url::parse(&candidate).map_err(|e| invalid(&e.to_string()))?;
        let transport = match url.scheme() {
            "http" | "https" => Transport::HttpPoll,
            "ws" | "wss" => Transport::WebSocket,
            other => return Err(invalid(&format!("unsupported scheme {other:?}"))),
        };
        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            base: url.as_str().trim_end_matches('/').to_string(),
            transport,
        })
    }

    /// Base URL without trailing slash.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Absolute URL for a server path such as `/tunnels/{id}/out`.
    pub fn join(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

/// Where the server should connect each tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub local_host: String,
    pub local_port: u16,
    pub url: TunnelUrl,
    pub token: String,
    /// `None` sends an empty creation body and lets the server choose.
    pub destination: Option<Destination>,
    pub log_level: String,
    pub retry: RetryConfig,
}

impl ClientConfig {
    /// Resolve flags, environment, file and defaults into one configuration.
    pub fn load(cli: &Cli) -> Result<Self, ClientError> {
        let file = match &cli.config {
            Some(path) => FileConfig::from_path(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file)
    }

    fn resolve(cli: &Cli, file: FileConfig) -> Result<Self, ClientError> {
        let raw_url = cli
            .url
            .clone()
            .or(file.url)
            .ok_or_else(|| ClientError::Config("no tunnel URL (use --url or HTTPTUN_URL)".into()))?;
        let url = TunnelUrl::parse(&raw_url)?;

        let dst_host = cli.dst_host.clone().or(file.dst_host);
        let dst_port = cli.dst_port.or(file.dst_port);
        let destination = match (dst_host, dst_port) {
            (Some(host), Some(port)) => Some(Destination { host, port }),
            (Some(host), None) => {
                return Err(ClientError::Config(format!(
                    "destination host {host:?} given without a port"
                )))
            }
            (None, _) => None,
        };

        if file.retry.max_retries == 0 {
            return Err(ClientError::Config("retry.max_retries must be at least 1".into()));
        }

        Ok(Self {
            local_host: cli
                .local_host
                .clone()
                .or(file.local_host)
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            local_port: cli.local_port.or(file.local_port).unwrap_or(20000),
            url,
            token: cli.token.clone().or(file.token).unwrap_or_default(),
            destination,
            log_level: cli
                .log_level
                .clone()
                .or(file.logging.level)
                .unwrap_or_else(|| "error".to_string()),
            retry: file.retry,
        })
    }

    /// `host:port` for the local listener.
    pub fn listen_addr(&self) -> String {
        if self.local_host.contains(':') {
            format!("[{}]:{}", self.local_host, self.local_port)
        } else {
            format!("{}:{}", self.local_host, self.local_port)
        }
    }
}

impl FileConfig {
    fn from_path(path: &Path) -> Result<Self, ClientError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&contents).map_err(|e| {
            ClientError::Config(format!("failed to parse config file {}: {e}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(url: &str) -> Cli {
        Cli {
            url: Some(url.to_string()),
            ..Cli::default()
        }
    }

    #[test]
    fn bare_host_defaults_to_https_polling() {
        let url = TunnelUrl::parse("  tunnel.example.com/ ").unwrap();
        assert_eq!(url.base(), "https://tunnel.example.com");
        assert_eq!(url.transport(), Transport::HttpPoll);
        assert_eq!(url.join("/tunnels"), "https://tunnel.example.com/tunnels");
    }

    #[test]
    fn scheme_selects_transport() {
        assert_eq!(
            TunnelUrl::parse("http://127.0.0.1:8080").unwrap().transport(),
            Transport::HttpPoll
        );
        assert_eq!(
            TunnelUrl::parse("wss://tunnel.example.com").unwrap().transport(),
            Transport::WebSocket
        );
        assert!(matches!(
            TunnelUrl::parse("ftp://tunnel.example.com"),
            Err(ClientError::InvalidTunnelUrl { .. })
        ));
        assert!(TunnelUrl::parse("   ").is_err());
    }

    #[test]
    fn defaults_apply_without_file() {
        let config = ClientConfig::resolve(&cli("http://localhost:8080"), FileConfig::default()).unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:20000");
        assert_eq!(config.log_level, "error");
        assert_eq!(config.retry.max_retries, 10);
        assert_eq!(config.destination, None);
    }

    #[test]
    fn flags_override_file() {
        let file: FileConfig = toml::from_str(
            r#"
            url = "https://from-file.example.com"
            local_port = 3000
            dst_host = "db.internal"
            dst_port = 5432
            token = "file-token"

            [retry]
            max_retries = 3
            base_delay_ms = 0
            "#,
        )
        .unwrap();
        let cli = Cli {
            dst_port: Some(6543),
            token: Some("flag-token".into()),
            ..Cli::default()
        };
        let config = ClientConfig::resolve(&cli, file).unwrap();
        assert_eq!(config.url.base(), "https://from-file.example.com");
        assert_eq!(config.local_port, 3000);
        assert_eq!(
            config.destination,
            Some(Destination {
                host: "db.internal".into(),
                port: 6543
            })
        );
        assert_eq!(config.token, "flag-token");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.max_delay_ms, 5000);
    }

    #[test]
    fn host_without_port_is_rejected() {
        let cli = Cli {
            dst_host: Some("db".into()),
            ..cli("http://localhost")
        };
        assert!(matches!(
            ClientConfig::resolve(&cli, FileConfig::default()),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn missing_url_is_a_config_error() {
        assert!(matches!(
            ClientConfig::resolve(&Cli::default(), FileConfig::default()),
            Err(ClientError::Config(_))
        ));
    }
}
