//! Tunnel resource endpoints.
//!
//! - `GET    /tunnels`               : list descriptors
//! - `POST   /tunnels`               : connect a destination, `201` + descriptor
//! - `GET    /tunnels/{id}`          : one descriptor
//! - `DELETE /tunnels/{id}`          : `202` closing, `204` removed
//! - `GET    /tunnels/{id}/out/{seq}`: outbound bytes (long-poll)
//! - `PUT    /tunnels/{id}/in/{seq}` : inbound bytes, `201` duplicate, `202` applied
//!
//! ## Creation body
//!
//! `{"host": "db.internal", "port": 5432}`. An empty body falls back to
//! `server.default_destination`; without one the request is a `400`.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::error::TunnelError;
use crate::tunnel::{DeleteOutcome, PutOutcome, TunnelDescriptor};
use crate::AppState;

/// Request body for `POST /tunnels`.
#[derive(Debug, Deserialize)]
pub struct CreateTunnel {
    pub host: String,
    pub port: u16,
}

/// `GET /tunnels`
pub async fn list_tunnels(State(state): State<AppState>) -> Json<Vec<TunnelDescriptor>> {
    Json(state.registry.list().await)
}

/// `POST /tunnels` answers only once the destination is connected.
pub async fn create_tunnel(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<TunnelDescriptor>), TunnelError> {
    let (host, port) = destination_from_body(&state, &body)?;
    let descriptor = state.registry.open(&host, port).await?;
    Ok((StatusCode::CREATED, Json(descriptor)))
}

fn destination_from_body(state: &AppState, body: &[u8]) -> Result<(String, u16), TunnelError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return state
            .config
            .server
            .default_destination()
            .map_err(|e| TunnelError::BadRequest(e.to_string()))?
            .ok_or_else(|| TunnelError::BadRequest("missing destination host and port".into()));
    }

    let req: CreateTunnel = serde_json::from_slice(body)
        .map_err(|e| TunnelError::BadRequest(format!("invalid tunnel request: {e}")))?;
    if req.host.is_empty() || req.port == 0 {
        return Err(TunnelError::BadRequest(format!(
            "invalid destination {}:{}",
            req.host, req.port
        )));
    }
    Ok((req.host, req.port))
}

/// `GET /tunnels/{id}`
pub async fn get_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TunnelDescriptor>, TunnelError> {
    let tunnel = state.registry.get(&id).await?;
    Ok(Json(tunnel.descriptor().await))
}

/// `DELETE /tunnels/{id}`
pub async fn delete_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, TunnelError> {
    match state.registry.delete(&id).await? {
        DeleteOutcome::Closing => Ok(StatusCode::ACCEPTED),
        DeleteOutcome::Removable => Ok(StatusCode::NO_CONTENT),
    }
}

/// `GET /tunnels/{id}/out/{seq}`
pub async fn read_out(
    State(state): State<AppState>,
    Path((id, seq)): Path<(String, String)>,
) -> Result<impl IntoResponse, TunnelError> {
    let seq = parse_seq(&seq)?;
    let data = state.registry.read(&id, seq).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data))
}

/// `PUT /tunnels/{id}/in/{seq}`
pub async fn write_in(
    State(state): State<AppState>,
    Path((id, seq)): Path<(String, String)>,
    body: Bytes,
) -> Result<StatusCode, TunnelError> {
    let seq = parse_seq(&seq)?;
    match state.registry.write(&id, seq, body).await? {
        PutOutcome::Duplicate => Ok(StatusCode::CREATED),
        PutOutcome::Applied => Ok(StatusCode::ACCEPTED),
    }
}

fn parse_seq(raw: &str) -> Result<u64, TunnelError> {
    raw.parse()
        .map_err(|_| TunnelError::BadRequest(format!("invalid sequence number {raw:?}")))
}
