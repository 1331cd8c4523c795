//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::tunnel::{TunnelRegistry, TunnelSettings};

/// Shared application state for the tunnel server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Live tunnels keyed by id.
    pub registry: TunnelRegistry,
    /// Monotonic instant when the server started (for uptime logging).
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = TunnelRegistry::new(TunnelSettings::from(&config.server));
        Self {
            config: Arc::new(config),
            registry,
            start_time: Instant::now(),
        }
    }
}
