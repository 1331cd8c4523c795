//! Local listener: one tunnel per accepted connection.
//!
//! The tunnel is opened before anything is read from the accepted socket, so
//! no local data races tunnel setup. If the tunnel cannot be opened the local
//! connection is simply closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::pump::{self, SocketSink, SocketSource};
use crate::tunnel::TunnelConnector;

/// Process-wide counter numbering connections in log output.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Next session number for log correlation (starts at 1).
pub fn next_session_id() -> u64 {
    SESSION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// Accept connections until `shutdown` is cancelled. Connections already
/// being served keep running.
pub async fn serve(listener: TcpListener, connector: Arc<TunnelConnector>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let session = next_session_id();
        let span = info_span!("tunnel", session, component = "client", %peer);
        tokio::spawn(handle_connection(stream, Arc::clone(&connector)).instrument(span));
    }
}

/// Open a tunnel for one local connection and pump until either side ends.
pub async fn handle_connection(stream: TcpStream, connector: Arc<TunnelConnector>) {
    info!("l -> t connection accepted");
    let _ = stream.set_nodelay(true);

    let tunnel = match connector.open().await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            error!("failed to open tunnel: {e}");
            return;
        }
    };
    let closed = tunnel.close_signal();
    let (tunnel_rx, tunnel_tx) = tunnel.into_split();
    let (local_rx, local_tx) = stream.into_split();

    pump::run(
        SocketSource::new(local_rx),
        SocketSink::new(local_tx),
        tunnel_rx,
        tunnel_tx,
    )
    .await;

    let reason = closed.borrow().clone();
    match reason {
        Some(reason) if reason.is_error() => error!("tunnel failed: {reason}"),
        Some(reason) => info!("l <- t connection finished, tunnel {reason}"),
        None => info!("l <- t connection finished"),
    }
}
