//! WebSocket transport.
//!
//! Connects to `{url}/websocket/{host}/{port}` with the `Auth-Token` header.
//! Every chunk travels as one text frame holding standard base64; incoming
//! binary frames are accepted as raw bytes. The WebSocket keeps order and
//! framing, so there are no sequence numbers, and the connection closing is
//! the tunnel closing.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::http_poll::AUTH_HEADER;
use super::sequencer::{Attempts, Op};
use super::{signal_closed, Driver, Tunnel, TunnelConnector, CHANNEL_DEPTH};
use crate::error::{ClientError, CloseReason};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Closed = Arc<watch::Sender<Option<CloseReason>>>;

/// Connect the WebSocket and start its reader and writer.
pub(crate) async fn open(connector: &TunnelConnector) -> Result<Tunnel, ClientError> {
    let destination = connector.destination.as_ref().ok_or_else(|| {
        ClientError::Config("the WebSocket transport needs a destination host and port".into())
    })?;
    let url = connector.url.join(&format!(
        "/websocket/{}/{}",
        destination.host, destination.port
    ));

    let stream = connect(connector, &url).await?;
    info!("websocket open to {}:{}", destination.host, destination.port);
    let (sink, source) = stream.split();

    let (closed_tx, closed_rx) = watch::channel(None);
    let closed: Closed = Arc::new(closed_tx);
    let cancel = CancellationToken::new();
    let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (outgoing_tx, outgoing_rx) = mpsc::channel(CHANNEL_DEPTH);

    let reader = tokio::spawn(
        run_reader(source, incoming_tx, cancel.clone(), Arc::clone(&closed)).in_current_span(),
    );
    let writer = tokio::spawn(
        run_writer(sink, outgoing_rx, cancel.clone(), Arc::clone(&closed)).in_current_span(),
    );

    Ok(Tunnel::new(
        incoming_rx,
        outgoing_tx,
        Driver::WebSocket(WsDriver {
            cancel,
            closed,
            reader,
            writer,
        }),
        closed_rx,
    ))
}

async fn connect(connector: &TunnelConnector, url: &str) -> Result<WsStream, ClientError> {
    let token = HeaderValue::from_str(&connector.token)
        .map_err(|e| ClientError::Config(format!("token is not a valid header value: {e}")))?;
    let mut attempts = Attempts::new(Op::Open, connector.policy());
    loop {
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(AUTH_HEADER, token.clone());
        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _)) => return Ok(stream),
            Err(e) => warn!("open: {e}"),
        }
        match attempts.fail() {
            Ok(delay) => tokio::time::sleep(delay).await,
            Err(_) => {
                return Err(ClientError::RetriesExhausted {
                    op: Op::Open.name(),
                    attempts: attempts.failures(),
                })
            }
        }
    }
}

async fn run_reader(
    mut source: SplitStream<WsStream>,
    chunks: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    closed: Closed,
) {
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => return,
            msg = source.next() => msg,
        };
        let chunk = match msg {
            Some(Ok(Message::Text(text))) => match decode_chunk(text.as_str()) {
                Ok(chunk) => Bytes::from(chunk),
                Err(e) => {
                    warn!("bad base64 frame: {e}");
                    break;
                }
            },
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("websocket receive failed: {e}");
                break;
            }
        };
        debug!("frame in: {} bytes", chunk.len());
        tokio::select! {
            () = cancel.cancelled() => return,
            sent = chunks.send(chunk) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
    signal_closed(&closed, CloseReason::Remote);
    cancel.cancel();
}

async fn run_writer(
    mut sink: SplitSink<WsStream, Message>,
    mut chunks: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    closed: Closed,
) {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => None,
            chunk = chunks.recv() => chunk,
        };
        let Some(chunk) = next else { break };
        debug!("frame out: {} bytes", chunk.len());
        if let Err(e) = sink.send(Message::Text(STANDARD.encode(&chunk).into())).await {
            debug!("websocket send failed: {e}");
            signal_closed(&closed, CloseReason::Remote);
            cancel.cancel();
            return;
        }
    }
    let _ = sink.close().await;
}

/// Decode a base64 text frame, tolerating MIME-style line breaks.
fn decode_chunk(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD.decode(compact)
}

/// Reader and writer tasks of one WebSocket tunnel.
pub(crate) struct WsDriver {
    cancel: CancellationToken,
    closed: Closed,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsDriver {
    /// Send everything already queued, close the socket, then stop reading.
    pub(crate) async fn finish(self) {
        signal_closed(&self.closed, CloseReason::Local);
        let _ = self.writer.await;
        self.cancel.cancel();
        let _ = self.reader.await;
    }

    pub(crate) async fn close(self) {
        signal_closed(&self.closed, CloseReason::Local);
        self.cancel.cancel();
        let _ = self.writer.await;
        let _ = self.reader.await;
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_accepts_wrapped_base64() {
        assert_eq!(decode_chunk("dGhp\r\ncyBp\ncw==").unwrap(), b"this is");
        assert!(decode_chunk("%%%").is_err());
    }
}
