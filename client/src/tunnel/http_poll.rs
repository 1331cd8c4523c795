//! HTTP polling transport.
//!
//! ## Lifecycle
//!
//! 1. `POST /tunnels` (JSON `{host, port}`, or empty) until the server answers
//!    with a descriptor or the retry budget runs out.
//! 2. A reader task long-polls `GET {path_out}/{seq}` without a timeout and
//!    forwards each body; a writer task coalesces queued bytes and sends them
//!    with `PUT {path_in}/{seq}`. Each keeps its own sequence and retry count.
//! 3. Closing cancels both tasks (an in-flight PUT is allowed to complete)
//!    and sends `DELETE {path}` with the same bounded retry.
//!
//! Any 404/410 on a read or write ends the tunnel at once. Other failures
//! retry the same sequence with backoff, and a retry in backoff is cut short
//! by cancellation.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::sequencer::{Attempts, Op, Outcome, ReadSequencer, RetryPolicy, Step, WriteSequencer};
use super::{signal_closed, Driver, Tunnel, TunnelConnector, CHANNEL_DEPTH};
use crate::error::{ClientError, CloseReason};

/// Header carrying the shared token.
pub const AUTH_HEADER: &str = "Auth-Token";

/// The parts of the server's tunnel descriptor the client needs.
#[derive(Debug, Deserialize)]
struct TunnelPaths {
    path: String,
    path_in: String,
    path_out: String,
}

/// State shared by the reader task, the writer task and the driver.
struct Shared {
    http: reqwest::Client,
    token: String,
    delete_url: String,
    in_url: String,
    out_url: String,
    request_timeout: Duration,
    policy: RetryPolicy,
    cancel: CancellationToken,
    closed: watch::Sender<Option<CloseReason>>,
}

/// Create the remote tunnel and start its reader and writer.
pub(crate) async fn open(connector: &TunnelConnector) -> Result<Tunnel, ClientError> {
    let paths = create(connector).await?;
    info!("tunnel open at {}", paths.path);

    let (closed_tx, closed_rx) = watch::channel(None);
    let shared = Arc::new(Shared {
        http: connector.http.clone(),
        token: connector.token.clone(),
        delete_url: connector.url.join(&paths.path),
        in_url: connector.url.join(&paths.path_in),
        out_url: connector.url.join(&paths.path_out),
        request_timeout: connector.retry.request_timeout(),
        policy: connector.policy(),
        cancel: CancellationToken::new(),
        closed: closed_tx,
    });

    let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (outgoing_tx, outgoing_rx) = mpsc::channel(CHANNEL_DEPTH);
    let reader = tokio::spawn(run_reader(Arc::clone(&shared), incoming_tx).in_current_span());
    let writer = tokio::spawn(
        run_writer(
            Arc::clone(&shared),
            outgoing_rx,
            connector.retry.max_put_bytes,
        )
        .in_current_span(),
    );

    Ok(Tunnel::new(
        incoming_rx,
        outgoing_tx,
        Driver::HttpPoll(PollDriver {
            shared,
            reader,
            writer,
        }),
        closed_rx,
    ))
}

/// `POST /tunnels` with bounded retry.
async fn create(connector: &TunnelConnector) -> Result<TunnelPaths, ClientError> {
    let url = connector.url.join("/tunnels");
    let mut attempts = Attempts::new(Op::Open, connector.policy());
    loop {
        let mut request = connector
            .http
            .post(&url)
            .header(AUTH_HEADER, &connector.token)
            .timeout(connector.retry.request_timeout());
        if let Some(destination) = &connector.destination {
            request = request.json(destination);
        }

        match request.send().await {
            Ok(resp) if Op::Open.classify(resp.status()) == Outcome::Success => {
                return resp.json::<TunnelPaths>().await.map_err(|e| {
                    ClientError::Protocol(format!("invalid tunnel descriptor: {e}"))
                });
            }
            Ok(resp) => warn!("open: server answered {}", resp.status()),
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

impl Shared {
    /// Act on a sequencer step. Returns `false` when the task must stop.
    async fn follow(&self, step: Step) -> bool {
        match step {
            Step::Advance => !self.cancel.is_cancelled(),
            Step::Retry(delay) => {
                tokio::select! {
                    () = self.cancel.cancelled() => false,
                    () = tokio::time::sleep(delay) => true,
                }
            }
            Step::Close(reason) => {
                signal_closed(&self.closed, reason);
                self.cancel.cancel();
                false
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<(StatusCode, Bytes), reqwest::Error> {
        let resp = self
            .http
            .get(url)
            .header(AUTH_HEADER, &self.token)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        Ok((status, body))
    }

    async fn put(&self, url: &str, body: Bytes) -> Result<StatusCode, reqwest::Error> {
        let resp = self
            .http
            .put(url)
            .header(AUTH_HEADER, &self.token)
            .timeout(self.request_timeout)
            .body(body)
            .send()
            .await?;
        Ok(resp.status())
    }

    /// `DELETE` the remote tunnel with bounded retry.
    async fn delete(&self) -> Result<(), ClientError> {
        let mut attempts = Attempts::new(Op::Delete, self.policy);
        loop {
            let result = self
                .http
                .delete(&self.delete_url)
                .header(AUTH_HEADER, &self.token)
                .timeout(self.request_timeout)
                .send()
                .await;
            match result {
                Ok(resp) if Op::Delete.classify(resp.status()) == Outcome::Success => {
                    debug!("delete: server answered {}", resp.status());
                    return Ok(());
                }
                Ok(resp) => debug!("delete: server answered {}", resp.status()),
                Err(e) => debug!("delete: {e}"),
            }
            match attempts.fail() {
                Ok(delay) => tokio::time::sleep(delay).await,
                Err(_) => {
                    return Err(ClientError::RetriesExhausted {
                        op: Op::Delete.name(),
                        attempts: attempts.failures(),
                    })
                }
            }
        }
    }
}

/// Long-poll `GET out/{seq}` and forward each body in order.
async fn run_reader(shared: Arc<Shared>, chunks: mpsc::Sender<Bytes>) {
    let mut reader = ReadSequencer::new(shared.policy);
    loop {
        let seq = reader.seq();
        let url = format!("{}/{seq}", shared.out_url);
        let result = tokio::select! {
            () = shared.cancel.cancelled() => return,
            r = shared.fetch(&url) => r,
        };

        let step = match result {
            Ok((status, body)) => {
                let step = reader.on_status(status);
                if step == Step::Advance {
                    debug!(seq, "get {} bytes", body.len());
                    tokio::select! {
                        () = shared.cancel.cancelled() => return,
                        sent = chunks.send(body) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                } else {
                    debug!(seq, %status, "get: server answered");
                }
                step
            }
            Err(e) => {
                debug!(seq, "get: {e}");
                reader.on_transport_error()
            }
        };

        if !shared.follow(step).await {
            return;
        }
    }
}

/// Coalesce queued chunks and `PUT in/{seq}` them, one request at a time.
/// Returns once the queue is closed and drained, or on cancellation.
async fn run_writer(shared: Arc<Shared>, mut chunks: mpsc::Receiver<Bytes>, max_put_bytes: usize) {
    let mut writer = WriteSequencer::new(shared.policy, max_put_bytes);
    loop {
        if writer.is_idle() {
            let next = tokio::select! {
                () = shared.cancel.cancelled() => None,
                chunk = chunks.recv() => chunk,
            };
            match next {
                Some(chunk) => writer.queue(&chunk),
                None => return,
            }
        }
        while let Ok(chunk) = chunks.try_recv() {
            writer.queue(&chunk);
        }
        if shared.cancel.is_cancelled() {
            writer.close();
        }

        let Some((seq, body)) = writer.next_put() else {
            return;
        };
        let url = format!("{}/{seq}", shared.in_url);
        debug!(seq, "put {} bytes", body.len());
        let step = match shared.put(&url, body).await {
            Ok(status) => {
                let step = writer.on_status(status);
                if step != Step::Advance {
                    debug!(seq, %status, "put: server answered");
                }
                step
            }
            Err(e) => {
                debug!(seq, "put: {e}");
                writer.on_transport_error()
            }
        };

        if !shared.follow(step).await {
            return;
        }
    }
}

/// Reader and writer tasks of one polling tunnel.
pub(crate) struct PollDriver {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PollDriver {
    /// Wait for the writer to drain (its queue sender must already be
    /// dropped), then close.
    pub(crate) async fn finish(self) {
        let _ = self.writer.await;
        shutdown(&self.shared, self.reader).await;
    }

    pub(crate) async fn close(self) {
        shutdown(&self.shared, self.reader).await;
    }

    pub(crate) fn cancel(&self) {
        self.shared.cancel.cancel();
    }
}

async fn shutdown(shared: &Shared, reader: JoinHandle<()>) {
    shared.cancel.cancel();
    signal_closed(&shared.closed, CloseReason::Local);
    if let Err(e) = shared.delete().await {
        warn!("failed to delete remote tunnel: {e}");
    }
    let _ = reader.await;
}
