//! Liveness banner.

/// `GET /`: identifies the server; any `200` means it is up.
pub async fn banner() -> String {
    format!("HTTP Tunnel (HTTP Transport) {}\n", env!("CARGO_PKG_VERSION"))
}
