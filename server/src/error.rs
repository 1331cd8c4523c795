//! Error kinds surfaced by tunnel operations and their HTTP mapping.
//!
//! Every variant maps to exactly one status code; the body is a short
//! plain-text line so retrying clients can log it verbatim.
//!
//! | Variant               | Status |
//! |-----------------------|--------|
//! | `InvalidSequence`     | 400    |
//! | `BadRequest`          | 400    |
//! | `TunnelNotFound`      | 404    |
//! | `ReaderDisplaced`     | 409    |
//! | `TunnelClosed`        | 410    |
//! | `DestinationConnect`  | 502    |
//! | `DestinationTimeout`  | 504    |

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Failure of a single tunnel operation. Local to the tunnel it concerns.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// The requested sequence is neither the current one nor the next one.
    #[error("invalid sequence {seq} for server seq {current}")]
    InvalidSequence { seq: u64, current: u64 },

    /// Malformed request (unparseable sequence, bad creation body, ...).
    #[error("{0}")]
    BadRequest(String),

    /// Unknown tunnel id. Also what an authentication failure looks like.
    #[error("tunnel {0} does not exist")]
    TunnelNotFound(String),

    /// A newer long-poll GET replaced this one as the waiting reader.
    #[error("request superseded by a newer reader")]
    ReaderDisplaced,

    /// The destination is gone and nothing is left to deliver.
    #[error("destination socket closed")]
    TunnelClosed,

    #[error("failed to connect to {host}:{port}: {source}")]
    DestinationConnect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {host}:{port}")]
    DestinationTimeout { host: String, port: u16 },
}

impl TunnelError {
    /// HTTP status code this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidSequence { .. } | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::TunnelNotFound(_) => StatusCode::NOT_FOUND,
            Self::ReaderDisplaced => StatusCode::CONFLICT,
            Self::TunnelClosed => StatusCode::GONE,
            Self::DestinationConnect { .. } => StatusCode::BAD_GATEWAY,
            Self::DestinationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        (self.status(), format!("{self}\n")).into_response()
    }
}

/// Configuration file could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
