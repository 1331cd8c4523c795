//! WebSocket transport: `GET /websocket/{host}/{port}`.
//!
//! One WebSocket relays one destination connection. No sequencing is needed
//! because the WebSocket already preserves order and framing.
//!
//! ## Framing
//!
//! | Direction            | Frame                                      |
//! |----------------------|--------------------------------------------|
//! | destination → client | text, standard base64 of one read chunk    |
//! | client → destination | text (base64, whitespace ignored) or binary |
//!
//! The destination is connected before the upgrade completes, so a refused
//! or timed-out connect is an ordinary `502`/`504` HTTP response. Afterwards,
//! closing either side closes the other.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::TunnelError;
use crate::tunnel::{destination, next_session_id};
use crate::AppState;

const READ_CHUNK: usize = 64 * 1024;

/// Upgrade handler for `GET /websocket/{host}/{port}`.
pub async fn ws_relay(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((host, port)): Path<(String, u16)>,
) -> Result<Response, TunnelError> {
    let stream = destination::connect(&host, port, state.config.server.connect_timeout()).await?;
    let session = next_session_id();
    let span = info_span!("tunnel", session, component = "websocket");
    span.in_scope(|| info!("t -> d connected to {host}:{port}"));

    Ok(ws.on_upgrade(move |socket| relay(socket, stream).instrument(span)))
}

async fn relay(socket: WebSocket, stream: TcpStream) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut dst_rx, mut dst_tx) = stream.into_split();

    let client_to_destination = async {
        while let Some(msg) = ws_rx.next().await {
            let chunk = match msg {
                Ok(Message::Text(text)) => match decode_chunk(text.as_str()) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("dropping connection: bad base64 frame: {e}");
                        break;
                    }
                },
                Ok(Message::Binary(data)) => data.to_vec(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("websocket receive failed: {e}");
                    break;
                }
            };
            debug!("t -> d {}", chunk.len());
            if let Err(e) = dst_tx.write_all(&chunk).await {
                warn!("write to destination failed: {e}");
                break;
            }
        }
        let _ = dst_tx.shutdown().await;
    };

    let destination_to_client = async {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match dst_rx.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("read from destination failed: {e}");
                    break;
                }
            };
            debug!("t <- d {n}");
            let frame = Message::Text(STANDARD.encode(&buf[..n]).into());
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    };

    tokio::select! {
        () = client_to_destination => {}
        () = destination_to_client => {}
    }
    info!("t <- d disconnected");
}

/// Decode a base64 text frame, tolerating MIME-style line breaks.
fn decode_chunk(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD.decode(compact)
}
