#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::unused_async)]
#![allow(clippy::len_without_is_empty)]

//! httptun library: the server half of the HTTP tunnel.
//!
//! - `tunnel`: `ServerTunnel` state machine, destination pump, registry
//! - `routes`: REST endpoints and router assembly
//! - `ws`: WebSocket relay transport
//! - `auth`: `Auth-Token` middleware
//! - `config`: configuration loading
//! - `error`: error kinds and their HTTP status mapping

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod tunnel;
pub mod ws;

pub use config::Config;
pub use error::{ConfigError, TunnelError};
pub use routes::router;
pub use state::AppState;
pub use tunnel::{TunnelDescriptor, TunnelRegistry};
