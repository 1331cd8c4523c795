//! Destination socket task.
//!
//! One task per tunnel owns the TCP connection. It applies queued writes in
//! order and feeds reads into the tunnel, waiting on the `paused` flag before
//! each read so a client that stops fetching eventually stops the destination.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::session::{DestinationLink, ServerTunnel};
use crate::error::TunnelError;

/// Largest single read from the destination.
const READ_CHUNK: usize = 64 * 1024;

/// Work queued for the destination task by the HTTP handlers.
#[derive(Debug)]
pub enum DestinationCommand {
    /// Write these bytes to the destination.
    Write(Bytes),
    /// Close once every earlier write has been flushed.
    Close,
}

/// Connect to `host:port`, giving up after `timeout`.
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TunnelError> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            // Latency matters more than throughput for interactive protocols.
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(source)) => Err(TunnelError::DestinationConnect {
            host: host.to_string(),
            port,
            source,
        }),
        Err(_) => Err(TunnelError::DestinationTimeout {
            host: host.to_string(),
            port,
        }),
    }
}

/// Pump bytes until either side ends the connection. Returns `true` when the
/// tunnel is drained and can be removed from the registry.
pub async fn run(tunnel: Arc<ServerTunnel>, stream: TcpStream, link: DestinationLink) -> bool {
    let DestinationLink {
        mut commands,
        mut paused,
        mut aborted,
    } = link;
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            () = wait_aborted(&mut aborted) => {
                debug!(tunnel = %tunnel.id(), "destination cut off");
                break;
            }
            command = commands.recv() => match command {
                Some(DestinationCommand::Write(data)) => {
                    let written = tokio::select! {
                        () = wait_aborted(&mut aborted) => {
                            debug!(tunnel = %tunnel.id(), "destination cut off mid-write");
                            break;
                        }
                        written = writer.write_all(&data) => written,
                    };
                    if let Err(e) = written {
                        warn!(tunnel = %tunnel.id(), "write to destination failed: {e}");
                        break;
                    }
                }
                Some(DestinationCommand::Close) | None => {
                    debug!(tunnel = %tunnel.id(), "closing destination after pending writes");
                    let _ = writer.shutdown().await;
                    break;
                }
            },
            read = read_when_resumed(&mut reader, &mut paused, &mut buf) => match read {
                Ok(0) => {
                    debug!(tunnel = %tunnel.id(), "destination closed the connection");
                    break;
                }
                Ok(n) => tunnel.on_destination_data(&buf[..n]).await,
                Err(e) => {
                    warn!(tunnel = %tunnel.id(), "read from destination failed: {e}");
                    break;
                }
            },
        }
    }

    // Later PUTs must see the queue as gone.
    drop(commands);
    let drained = tunnel.on_destination_closed().await;
    info!(tunnel = %tunnel.id(), drained, "t <- d disconnected");
    drained
}

/// Resolves once the tunnel asks for the destination to be dropped.
async fn wait_aborted(aborted: &mut watch::Receiver<bool>) {
    // The sender lives in the tunnel, which outlives this task.
    let _ = aborted.wait_for(|aborted| *aborted).await;
}

async fn read_when_resumed(
    reader: &mut OwnedReadHalf,
    paused: &mut watch::Receiver<bool>,
    buf: &mut [u8],
) -> io::Result<usize> {
    // The sender lives in the tunnel, which outlives this task.
    let _ = paused.wait_for(|paused| !*paused).await;
    reader.read(buf).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_refused_maps_to_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn connect_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = connect("127.0.0.1", port, Duration::from_secs(5)).await;
        assert!(stream.is_ok());
    }
}
