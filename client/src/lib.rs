#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! httptun-client library: the client half of the HTTP tunnel.
//!
//! - `config`: flags, env and TOML resolution, tunnel URL parsing
//! - `tunnel`: `Tunnel` over HTTP polling or WebSocket
//! - `pump`: bidirectional byte pump between socket and tunnel
//! - `proxy`: local listener, one tunnel per connection
//! - `error`: error kinds and close reasons

pub mod config;
pub mod error;
pub mod proxy;
pub mod pump;
pub mod tunnel;

pub use config::{ClientConfig, Destination, RetryConfig, Transport, TunnelUrl};
pub use error::{ClientError, CloseReason};
pub use tunnel::{Tunnel, TunnelConnector};
