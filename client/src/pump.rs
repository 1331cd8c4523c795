//! Bidirectional byte pump.
//!
//! [`run`] forwards local → tunnel and tunnel → local concurrently. When
//! either direction ends (EOF, error, or the tunnel closing) both sinks are
//! shut down and the pump returns. The tunnel sink is shut down first, so a
//! local EOF still delivers every byte already queued before the tunnel is
//! deleted.

use std::future::Future;
use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::tunnel::{TunnelReceiver, TunnelSender};

/// Largest single read from the local socket.
const READ_CHUNK: usize = 64 * 1024;

/// Produces chunks until the peer is done (`Ok(None)`).
pub trait ChunkSource {
    fn next_chunk(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;
}

/// Consumes chunks.
pub trait ChunkSink {
    fn send_chunk(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Flush what can be flushed and close. Must be idempotent.
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
}

/// Pump between a local endpoint and a tunnel until either side ends.
pub async fn run<LS, LK, TS, TK>(mut local_rx: LS, mut local_tx: LK, mut tunnel_rx: TS, mut tunnel_tx: TK)
where
    LS: ChunkSource,
    LK: ChunkSink,
    TS: ChunkSource,
    TK: ChunkSink,
{
    tokio::select! {
        () = forward(&mut local_rx, &mut tunnel_tx, "l -> t") => debug!("local side finished"),
        () = forward(&mut tunnel_rx, &mut local_tx, "l <- t") => debug!("tunnel side finished"),
    }
    tunnel_tx.shutdown().await;
    local_tx.shutdown().await;
}

async fn forward<S: ChunkSource, K: ChunkSink>(source: &mut S, sink: &mut K, direction: &str) {
    loop {
        let chunk = match source.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return,
            Err(e) => {
                debug!("{direction} read failed: {e}");
                return;
            }
        };
        debug!("{direction} {}", chunk.len());
        if let Err(e) = sink.send_chunk(chunk).await {
            debug!("{direction} write failed: {e}");
            return;
        }
    }
}

/// Read half of an accepted local connection.
pub struct SocketSource {
    half: OwnedReadHalf,
    buf: BytesMut,
}

impl SocketSource {
    pub fn new(half: OwnedReadHalf) -> Self {
        Self {
            half,
            buf: BytesMut::new(),
        }
    }
}

impl ChunkSource for SocketSource {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        self.buf.reserve(READ_CHUNK);
        if self.half.read_buf(&mut self.buf).await? == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf.split().freeze()))
    }
}

/// Write half of an accepted local connection.
pub struct SocketSink {
    half: OwnedWriteHalf,
}

impl SocketSink {
    pub fn new(half: OwnedWriteHalf) -> Self {
        Self { half }
    }
}

impl ChunkSink for SocketSink {
    async fn send_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.half.write_all(&chunk).await
    }

    async fn shutdown(&mut self) {
        let _ = self.half.shutdown().await;
    }
}

impl ChunkSource for TunnelReceiver {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.receive().await)
    }
}

impl ChunkSink for TunnelSender {
    async fn send_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.send(chunk)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    async fn shutdown(&mut self) {
        self.finish().await;
    }
}
