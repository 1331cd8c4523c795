//! Client error kinds and terminal close reasons.

use std::fmt;

use tokio_tungstenite::tungstenite;

/// Errors returned by tunnel setup and configuration.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The tunnel URL could not be parsed or names an unsupported scheme.
    #[error("invalid tunnel URL {url:?}: {reason}")]
    InvalidTunnelUrl { url: String, reason: String },

    /// The tunnel is gone; nothing more can be sent or received.
    #[error("tunnel closed")]
    TunnelClosed,

    /// `attempts` consecutive transport failures for one operation.
    #[error("{op} failed after {attempts} attempts")]
    RetriesExhausted { op: &'static str, attempts: u32 },

    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The server's response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<tungstenite::Error> for ClientError {
    fn from(e: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

/// Why a tunnel stopped. Published once per tunnel on a `watch` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server reported the tunnel gone (404/410, or the WebSocket closed).
    Remote,
    /// This side closed the tunnel.
    Local,
    /// An operation kept failing until its retry budget ran out.
    RetriesExhausted { op: &'static str },
}

impl CloseReason {
    /// Whether the closure is a hard failure rather than a normal end.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => f.write_str("closed by server"),
            Self::Local => f.write_str("closed locally"),
            Self::RetriesExhausted { op } => write!(f, "{op} retries exhausted"),
        }
    }
}
