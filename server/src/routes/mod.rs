//! HTTP route handlers and router assembly.
//!
//! Every route, including the banner and the WebSocket upgrade, sits behind
//! [`crate::auth::require_token`].

pub mod health;
pub mod tunnels;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, put},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::{self, AuthToken};
use crate::{ws, AppState};

/// Build the complete application router.
pub fn router(state: AppState) -> Router {
    let max_request_bytes = state.config.server.max_request_bytes;
    let token = AuthToken(state.config.auth.token.clone());

    Router::new()
        .route("/", get(health::banner))
        .route(
            "/tunnels",
            get(tunnels::list_tunnels).post(tunnels::create_tunnel),
        )
        .route(
            "/tunnels/{id}",
            get(tunnels::get_tunnel).delete(tunnels::delete_tunnel),
        )
        .route("/tunnels/{id}/out/{seq}", get(tunnels::read_out))
        .route("/tunnels/{id}/in/{seq}", put(tunnels::write_in))
        .route("/websocket/{host}/{port}", get(ws::ws_relay))
        .layer(middleware::from_fn(auth::require_token))
        .layer(Extension(token))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
