//! Server-side tunnels.
//!
//! A tunnel owns one TCP connection to a destination and exposes it as a
//! pair of sequenced byte streams:
//!
//! - **out** (destination → client): `GET /tunnels/{id}/out/{seq}`, long-polled
//! - **in** (client → destination): `PUT /tunnels/{id}/in/{seq}`
//!
//! Each direction accepts only the current sequence (a retry) or the next
//! one (progress). Retries of GET replay the same bytes; retries of PUT are
//! acknowledged without being applied twice.
//!
//! - [`session`]: `ServerTunnel`, the per-tunnel state machine
//! - [`destination`]: the task pumping bytes to and from the destination socket
//! - [`registry`]: `TunnelRegistry`, id → tunnel map with inactivity sweep

pub mod destination;
pub mod registry;
pub mod session;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub use registry::{TunnelRegistry, TunnelSettings};
pub use session::{DeleteOutcome, PutOutcome, ServerTunnel};

/// Process-wide counter numbering tunnel sessions in log output.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Next session number for log correlation (starts at 1).
pub fn next_session_id() -> u64 {
    SESSION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// JSON description of a tunnel, returned by `POST /tunnels` and `GET /tunnels[/{id}]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDescriptor {
    pub id: String,
    pub path: String,
    pub path_in: String,
    pub path_out: String,
    pub dst_host: String,
    pub dst_port: u16,
    pub dst_connected: bool,
    pub seq_out: u64,
    pub seq_in: u64,
}

/// When a tunnel whose destination has closed leaves the registry.
///
/// Either way the tunnel is only removed once nothing received from the
/// destination is still waiting for its first delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainPolicy {
    /// Remove as soon as no undelivered bytes are pending. The last chunk
    /// served can no longer be re-fetched after that.
    Pending,
    /// Also keep the tunnel while the last served chunk is replayable, until
    /// the client asks for the next sequence (which then answers 410).
    #[default]
    Acknowledged,
}

/// Request paths for tunnel `id`.
pub(crate) fn tunnel_path(id: &str) -> String {
    format!("/tunnels/{id}")
}
