//! Client-side tunnel transports.
//!
//! A [`Tunnel`] is one remote tunnel session with `send`/`receive`/`close`.
//! The transport is picked once, from the URL scheme, when the
//! [`TunnelConnector`] opens it:
//!
//! - [`http_poll`]: sequenced `PUT in/{seq}` and long-polled `GET out/{seq}`
//!   with bounded retry (`http`, `https`)
//! - [`websocket`]: one persistent connection carrying base64 frames
//!   (`ws`, `wss`)
//!
//! Both transports run a reader task and a writer task and talk to the rest
//! of the client through two bounded channels, so [`TunnelReceiver`] and
//! [`TunnelSender`] are the same for either one. The reason a tunnel ended is
//! published once on a `watch` channel.

pub mod http_poll;
pub mod sequencer;
pub mod websocket;

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::{ClientConfig, Destination, RetryConfig, Transport, TunnelUrl};
use crate::error::{ClientError, CloseReason};
use sequencer::RetryPolicy;

/// Chunks buffered in each direction between the transport tasks and the
/// local connection.
pub(crate) const CHANNEL_DEPTH: usize = 16;

/// Observes why a tunnel ended; `None` while it is still open.
pub type CloseSignal = watch::Receiver<Option<CloseReason>>;

/// Publish the first close reason; later ones are ignored.
pub(crate) fn signal_closed(closed: &watch::Sender<Option<CloseReason>>, reason: CloseReason) {
    let first = closed.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason.clone());
            true
        } else {
            false
        }
    });
    if first {
        if reason.is_error() {
            warn!("tunnel {reason}");
        } else {
            info!("tunnel {reason}");
        }
    }
}

/// Opens tunnels against one server with one set of credentials.
pub struct TunnelConnector {
    pub(crate) http: reqwest::Client,
    pub(crate) url: TunnelUrl,
    pub(crate) token: String,
    pub(crate) destination: Option<Destination>,
    pub(crate) retry: RetryConfig,
}

impl TunnelConnector {
    pub fn new(
        url: TunnelUrl,
        token: String,
        destination: Option<Destination>,
        retry: RetryConfig,
    ) -> Result<Self, ClientError> {
        // No client-wide timeout: GET long-polls must be able to wait
        // indefinitely. Other requests set their own.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            url,
            token,
            destination,
            retry,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        Self::new(
            config.url.clone(),
            config.token.clone(),
            config.destination.clone(),
            config.retry,
        )
    }

    pub fn transport(&self) -> Transport {
        self.url.transport()
    }

    pub(crate) fn policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    /// Open a new tunnel, retrying creation within the retry budget.
    pub async fn open(&self) -> Result<Tunnel, ClientError> {
        match self.url.transport() {
            Transport::HttpPoll => http_poll::open(self).await,
            Transport::WebSocket => websocket::open(self).await,
        }
    }
}

/// Transport-specific background tasks behind a [`TunnelSender`].
pub(crate) enum Driver {
    HttpPoll(http_poll::PollDriver),
    WebSocket(websocket::WsDriver),
}

impl Driver {
    async fn finish(self) {
        match self {
            Self::HttpPoll(d) => d.finish().await,
            Self::WebSocket(d) => d.finish().await,
        }
    }

    async fn close(self) {
        match self {
            Self::HttpPoll(d) => d.close().await,
            Self::WebSocket(d) => d.close().await,
        }
    }

    fn cancel(&self) {
        match self {
            Self::HttpPoll(d) => d.cancel(),
            Self::WebSocket(d) => d.cancel(),
        }
    }
}

/// One open tunnel.
pub struct Tunnel {
    receiver: TunnelReceiver,
    sender: TunnelSender,
    closed: CloseSignal,
}

impl Tunnel {
    pub(crate) fn new(
        incoming: mpsc::Receiver<Bytes>,
        outgoing: mpsc::Sender<Bytes>,
        driver: Driver,
        closed: CloseSignal,
    ) -> Self {
        Self {
            receiver: TunnelReceiver { chunks: incoming },
            sender: TunnelSender {
                chunks: Some(outgoing),
                driver: Some(driver),
            },
            closed,
        }
    }

    /// Queue bytes for the destination.
    pub async fn send(&self, data: Bytes) -> Result<(), ClientError> {
        self.sender.send(data).await
    }

    /// Next chunk from the destination; `None` once the tunnel has ended.
    pub async fn receive(&mut self) -> Option<Bytes> {
        self.receiver.receive().await
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.closed.clone()
    }

    /// Stop both directions now and delete the remote tunnel.
    pub async fn close(self) {
        let Self { mut sender, .. } = self;
        sender.close().await;
    }

    /// Deliver everything already queued, then close.
    pub async fn finish(self) {
        let Self { mut sender, .. } = self;
        sender.finish().await;
    }

    pub fn into_split(self) -> (TunnelReceiver, TunnelSender) {
        (self.receiver, self.sender)
    }
}

/// Receiving half of a [`Tunnel`].
pub struct TunnelReceiver {
    chunks: mpsc::Receiver<Bytes>,
}

impl TunnelReceiver {
    pub async fn receive(&mut self) -> Option<Bytes> {
        self.chunks.recv().await
    }
}

/// Sending half of a [`Tunnel`]; owns the transport tasks. Dropping it
/// without [`Self::finish`] or [`Self::close`] stops the tasks but leaves the
/// remote tunnel to the server's inactivity sweep.
pub struct TunnelSender {
    chunks: Option<mpsc::Sender<Bytes>>,
    driver: Option<Driver>,
}

impl TunnelSender {
    pub async fn send(&self, data: Bytes) -> Result<(), ClientError> {
        let Some(chunks) = &self.chunks else {
            return Err(ClientError::TunnelClosed);
        };
        chunks
            .send(data)
            .await
            .map_err(|_| ClientError::TunnelClosed)
    }

    /// Deliver everything already queued, then close. Idempotent.
    pub async fn finish(&mut self) {
        self.chunks = None;
        if let Some(driver) = self.driver.take() {
            driver.finish().await;
        }
    }

    /// Stop both directions now and delete the remote tunnel. Idempotent.
    pub async fn close(&mut self) {
        self.chunks = None;
        if let Some(driver) = self.driver.take() {
            driver.close().await;
        }
    }
}

impl Drop for TunnelSender {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            driver.cancel();
        }
    }
}
