//! Per-tunnel protocol state machine.
//!
//! [`ServerTunnel`] holds two outbound buffers and two sequence counters:
//!
//! - `outbound_ready`: bytes served for the current `seq_out`. Replayed
//!   verbatim when a GET for the same sequence is retried.
//! - `outbound_pending`: bytes received from the destination since then.
//!   Rotated into `outbound_ready` when the client asks for `seq_out + 1`.
//!
//! A GET that finds nothing to deliver parks a oneshot sender in the single
//! waiting-reader slot; destination data or destination close completes it.
//! All buffer state sits behind one mutex so the backpressure flag set on the
//! data path and cleared on the delivery path cannot race.
//!
//! Closing never waits on the write queue. `Close` is queued behind earlier
//! writes when there is room; otherwise a background task keeps trying for
//! the close grace period and then raises the `aborted` flag, which the
//! destination task obeys even in the middle of a write.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn, Instrument};

use super::destination::DestinationCommand;
use super::registry::TunnelSettings;
use super::{tunnel_path, DrainPolicy, TunnelDescriptor};
use crate::error::TunnelError;

/// Commands queued to the destination before `PUT` stops being acknowledged.
const COMMAND_QUEUE_DEPTH: usize = 32;

/// Result of an accepted `PUT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Retransmission of the last applied sequence; nothing was written.
    Duplicate,
    /// Bytes were queued to the destination and `seq_in` advanced.
    Applied,
}

/// Result of a `DELETE` or sweep request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Destination close initiated; removal follows once drained.
    Closing,
    /// Destination already gone; the tunnel can be removed now.
    Removable,
}

/// What a parked GET is woken with.
#[derive(Debug)]
enum ReadOutcome {
    Data(Bytes),
    Closed,
}

/// Receiving ends handed to the destination task.
pub struct DestinationLink {
    pub commands: mpsc::Receiver<DestinationCommand>,
    pub paused: watch::Receiver<bool>,
    /// Set when the destination must be dropped without flushing.
    pub aborted: watch::Receiver<bool>,
}

struct TunnelState {
    outbound_ready: Bytes,
    outbound_pending: BytesMut,
    seq_out: u64,
    seq_in: u64,
    pending_reader: Option<oneshot::Sender<ReadOutcome>>,
    last_active_at: Instant,
    destination_open: bool,
    delete_requested: bool,
}

impl TunnelState {
    fn rotate(&mut self) {
        self.outbound_ready = self.outbound_pending.split().freeze();
    }

    /// Hand whatever is pending to the parked reader, if any.
    fn wake_reader(&mut self) -> bool {
        let Some(reader) = self.pending_reader.take() else {
            return false;
        };
        self.rotate();
        let outcome = if self.outbound_ready.is_empty() {
            ReadOutcome::Closed
        } else {
            ReadOutcome::Data(self.outbound_ready.clone())
        };
        // A dropped receiver means the request went away; the bytes stay in
        // `outbound_ready` for its retry.
        let _ = reader.send(outcome);
        true
    }

    fn is_drained(&self, policy: DrainPolicy) -> bool {
        !self.destination_open
            && self.outbound_pending.is_empty()
            && (policy == DrainPolicy::Pending
                || self.delete_requested
                || self.outbound_ready.is_empty())
    }
}

/// One tunnel: a destination connection plus its sequenced buffers.
pub struct ServerTunnel {
    id: String,
    dst_host: String,
    dst_port: u16,
    session: u64,
    max_buffer_bytes: usize,
    drain_policy: DrainPolicy,
    close_grace: Duration,
    commands: mpsc::Sender<DestinationCommand>,
    paused: watch::Sender<bool>,
    aborted: Arc<watch::Sender<bool>>,
    state: Mutex<TunnelState>,
}

impl ServerTunnel {
    /// Create a tunnel for a connected destination. The returned link must be
    /// driven by [`super::destination::run`].
    pub fn new(
        id: String,
        dst_host: String,
        dst_port: u16,
        session: u64,
        settings: &TunnelSettings,
    ) -> (Arc<Self>, DestinationLink) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (paused_tx, paused_rx) = watch::channel(false);
        let (aborted_tx, aborted_rx) = watch::channel(false);
        let tunnel = Arc::new(Self {
            id,
            dst_host,
            dst_port,
            session,
            max_buffer_bytes: settings.max_buffer_bytes,
            drain_policy: settings.drain_policy,
            close_grace: settings.close_grace,
            commands: commands_tx,
            paused: paused_tx,
            aborted: Arc::new(aborted_tx),
            state: Mutex::new(TunnelState {
                outbound_ready: Bytes::new(),
                outbound_pending: BytesMut::new(),
                seq_out: 0,
                seq_in: 0,
                pending_reader: None,
                last_active_at: Instant::now(),
                destination_open: true,
                delete_requested: false,
            }),
        });
        let link = DestinationLink {
            commands: commands_rx,
            paused: paused_rx,
            aborted: aborted_rx,
        };
        (tunnel, link)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Session number used in this tunnel's log span.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Whether destination reads are currently paused for backpressure.
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// `GET out/{seq}`: serve (or replay) outbound bytes, long-polling when
    /// none are buffered yet.
    pub async fn get(&self, seq: u64) -> Result<Bytes, TunnelError> {
        let waiter = {
            let mut st = self.state.lock().await;
            st.last_active_at = Instant::now();

            if seq != st.seq_out && seq != st.seq_out + 1 {
                return Err(TunnelError::InvalidSequence {
                    seq,
                    current: st.seq_out,
                });
            }
            if seq == st.seq_out + 1 {
                st.rotate();
                st.seq_out = seq;
            }

            if !st.outbound_ready.is_empty() {
                debug!(tunnel = %self.id, seq, len = st.outbound_ready.len(), "get: returning data (immediate)");
                self.paused.send_replace(false);
                return Ok(st.outbound_ready.clone());
            }
            if !st.destination_open {
                return Err(TunnelError::TunnelClosed);
            }

            debug!(tunnel = %self.id, seq, "get: waiting for data");
            let (tx, rx) = oneshot::channel();
            if st.pending_reader.replace(tx).is_some() {
                debug!(tunnel = %self.id, seq, "get: displaced an earlier waiting reader");
            }
            rx
        };

        match waiter.await {
            Ok(ReadOutcome::Data(data)) => {
                debug!(tunnel = %self.id, seq, len = data.len(), "get: returning data (async)");
                self.paused.send_replace(false);
                Ok(data)
            }
            Ok(ReadOutcome::Closed) => Err(TunnelError::TunnelClosed),
            Err(_) => Err(TunnelError::ReaderDisplaced),
        }
    }

    /// `PUT in/{seq}`: apply inbound bytes once; acknowledge retransmissions.
    pub async fn put(&self, seq: u64, data: Bytes) -> Result<PutOutcome, TunnelError> {
        // Reserve queue space first so a slow destination holds back the PUT
        // without holding the state lock the destination task needs.
        let permit = self
            .commands
            .reserve()
            .await
            .map_err(|_| TunnelError::TunnelClosed)?;

        let mut st = self.state.lock().await;
        st.last_active_at = Instant::now();

        if seq != st.seq_in && seq != st.seq_in + 1 {
            return Err(TunnelError::InvalidSequence {
                seq,
                current: st.seq_in,
            });
        }
        if seq == st.seq_in {
            debug!(tunnel = %self.id, seq, "put: duplicate sequence, ignoring");
            return Ok(PutOutcome::Duplicate);
        }
        // After a DELETE the queued `Close` would discard these bytes.
        if !st.destination_open || st.delete_requested {
            return Err(TunnelError::TunnelClosed);
        }

        debug!(tunnel = %self.id, seq, "t -> d {}", data.len());
        permit.send(DestinationCommand::Write(data));
        st.seq_in = seq;
        Ok(PutOutcome::Applied)
    }

    /// `DELETE`: close the destination after pending writes, or report that
    /// the tunnel can go right away. Returns without waiting on the
    /// destination.
    pub async fn delete(&self) -> DeleteOutcome {
        {
            let mut st = self.state.lock().await;
            if !st.destination_open {
                return DeleteOutcome::Removable;
            }
            st.delete_requested = true;
        }
        match self.commands.try_send(DestinationCommand::Close) {
            Ok(()) => DeleteOutcome::Closing,
            Err(mpsc::error::TrySendError::Closed(_)) => DeleteOutcome::Removable,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(tunnel = %self.id, "write queue full, closing in the background");
                let commands = self.commands.clone();
                let aborted = Arc::clone(&self.aborted);
                let grace = self.close_grace;
                let id = self.id.clone();
                tokio::spawn(
                    async move {
                        let close = commands.send(DestinationCommand::Close);
                        if tokio::time::timeout(grace, close).await.is_err() {
                            warn!(tunnel = %id, "destination not draining, cutting it off");
                            aborted.send_replace(true);
                        }
                    }
                    .in_current_span(),
                );
                DeleteOutcome::Closing
            }
        }
    }

    /// Bytes arrived from the destination.
    pub async fn on_destination_data(&self, data: &[u8]) {
        let mut st = self.state.lock().await;
        debug!(tunnel = %self.id, "t <- d {}", data.len());
        st.outbound_pending.extend_from_slice(data);
        st.wake_reader();
        if st.outbound_pending.len() > self.max_buffer_bytes {
            debug!(tunnel = %self.id, buffered = st.outbound_pending.len(), "pausing destination reads");
            self.paused.send_replace(true);
        }
    }

    /// The destination connection ended. Returns `true` when the tunnel is
    /// drained and should leave the registry.
    pub async fn on_destination_closed(&self) -> bool {
        let mut st = self.state.lock().await;
        st.destination_open = false;
        st.wake_reader();
        st.is_drained(self.drain_policy)
    }

    /// Time since the last GET or PUT.
    pub async fn idle_for(&self) -> Duration {
        self.state.lock().await.last_active_at.elapsed()
    }

    #[cfg(test)]
    pub(crate) fn command_queue_is_full(&self) -> bool {
        self.commands.capacity() == 0
    }

    #[cfg(test)]
    pub(crate) async fn has_waiting_reader(&self) -> bool {
        self.state.lock().await.pending_reader.is_some()
    }

    pub async fn descriptor(&self) -> TunnelDescriptor {
        let st = self.state.lock().await;
        let path = tunnel_path(&self.id);
        TunnelDescriptor {
            id: self.id.clone(),
            path_in: format!("{path}/in"),
            path_out: format!("{path}/out"),
            path,
            dst_host: self.dst_host.clone(),
            dst_port: self.dst_port,
            dst_connected: st.destination_open,
            seq_out: st.seq_out,
            seq_in: st.seq_in,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_buffer_bytes: usize, drain_policy: DrainPolicy) -> TunnelSettings {
        TunnelSettings {
            max_buffer_bytes,
            drain_policy,
            ..TunnelSettings::default()
        }
    }

    fn tunnel(max_buffer_bytes: usize, policy: DrainPolicy) -> (Arc<ServerTunnel>, DestinationLink) {
        ServerTunnel::new(
            "t-1".into(),
            "foobar".into(),
            4242,
            1,
            &settings(max_buffer_bytes, policy),
        )
    }

    async fn wait_for_reader(t: &ServerTunnel) {
        while !t.has_waiting_reader().await {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn descriptor_reports_paths_and_counters() {
        let (t, _link) = tunnel(1024, DrainPolicy::Acknowledged);
        let d = t.descriptor().await;
        assert_eq!(d.path, "/tunnels/t-1");
        assert_eq!(d.path_in, "/tunnels/t-1/in");
        assert_eq!(d.path_out, "/tunnels/t-1/out");
        assert_eq!((d.dst_host.as_str(), d.dst_port), ("foobar", 4242));
        assert!(d.dst_connected);
        assert_eq!((d.seq_out, d.seq_in), (0, 0));
    }

    #[tokio::test]
    async fn out_of_window_sequences_are_rejected_without_side_effects() {
        let (t, _link) = tunnel(1024, DrainPolicy::Acknowledged);
        t.on_destination_data(b"data").await;
        for seq in [2, 3, 10] {
            assert!(matches!(
                t.get(seq).await,
                Err(TunnelError::InvalidSequence { current: 0, .. })
            ));
            assert!(matches!(
                t.put(seq, Bytes::from_static(b"x")).await,
                Err(TunnelError::InvalidSequence { current: 0, .. })
            ));
        }
        let d = t.descriptor().await;
        assert_eq!((d.seq_out, d.seq_in), (0, 0));
        // pending data is untouched and still served at seq 1
        assert_eq!(t.get(1).await.unwrap(), Bytes::from_static(b"data"));
        assert!(matches!(
            t.get(0).await,
            Err(TunnelError::InvalidSequence { current: 1, .. })
        ));
    }

    #[tokio::test]
    async fn put_applies_once_and_acknowledges_retransmission() {
        let (t, mut link) = tunnel(1024, DrainPolicy::Acknowledged);
        assert_eq!(
            t.put(1, Bytes::from_static(b"reply")).await.unwrap(),
            PutOutcome::Applied
        );
        assert_eq!(
            t.put(1, Bytes::from_static(b"reply")).await.unwrap(),
            PutOutcome::Duplicate
        );
        assert_eq!(t.descriptor().await.seq_in, 1);

        match link.commands.try_recv() {
            Ok(DestinationCommand::Write(data)) => assert_eq!(data, Bytes::from_static(b"reply")),
            other => panic!("expected a single write, got {other:?}"),
        }
        assert!(link.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn long_poll_is_completed_by_destination_data_and_replayable() {
        let (t, _link) = tunnel(1024, DrainPolicy::Acknowledged);
        let reader = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.get(1).await })
        };
        wait_for_reader(&t).await;

        t.on_destination_data(b"this is some data").await;
        let first = reader.await.unwrap().unwrap();
        assert_eq!(first, Bytes::from_static(b"this is some data"));
        assert_eq!(t.descriptor().await.seq_out, 1);

        // same sequence again: identical bytes, immediately
        assert_eq!(t.get(1).await.unwrap(), first);
    }

    #[tokio::test]
    async fn sequence_advances_one_chunk_at_a_time() {
        let (t, _link) = tunnel(1024, DrainPolicy::Acknowledged);
        t.on_destination_data(b"this is some data").await;
        assert_eq!(t.get(1).await.unwrap(), Bytes::from_static(b"this is some data"));

        t.on_destination_data(b"even more data!").await;
        // a retry of seq 1 still sees only the first chunk
        assert_eq!(t.get(1).await.unwrap(), Bytes::from_static(b"this is some data"));
        assert_eq!(t.get(2).await.unwrap(), Bytes::from_static(b"even more data!"));
        assert_eq!(t.descriptor().await.seq_out, 2);
    }

    #[tokio::test]
    async fn backpressure_pauses_above_threshold_and_resumes_on_delivery() {
        let max = 40_000;
        let (t, link) = tunnel(max, DrainPolicy::Acknowledged);
        let data = vec![b'A'; max - 2];
        t.on_destination_data(&data).await;
        t.on_destination_data(b"ab").await;
        assert!(!t.is_paused(), "exactly at the threshold is not over it");

        t.on_destination_data(b"c").await;
        assert!(t.is_paused());
        assert!(*link.paused.borrow());

        let got = t.get(1).await.unwrap();
        assert_eq!(got.len(), max + 1);
        assert!(got.ends_with(b"abc"));
        assert!(!t.is_paused());
    }

    #[tokio::test]
    async fn closed_destination_keeps_tunnel_until_buffer_is_drained() {
        let (t, _link) = tunnel(1024, DrainPolicy::Acknowledged);
        t.on_destination_data(b"last words").await;
        assert!(!t.on_destination_closed().await, "undelivered bytes must be kept");
        assert!(!t.descriptor().await.dst_connected);

        assert_eq!(t.get(1).await.unwrap(), Bytes::from_static(b"last words"));
        // retry still works after the destination went away
        assert_eq!(t.get(1).await.unwrap(), Bytes::from_static(b"last words"));
        assert!(matches!(t.get(2).await, Err(TunnelError::TunnelClosed)));
    }

    #[tokio::test]
    async fn pending_policy_drains_once_nothing_is_pending() {
        let (t, _link) = tunnel(1024, DrainPolicy::Pending);
        t.on_destination_data(b"chunk").await;
        assert_eq!(t.get(1).await.unwrap(), Bytes::from_static(b"chunk"));
        assert!(t.on_destination_closed().await);

        let (t, _link) = tunnel(1024, DrainPolicy::Acknowledged);
        t.on_destination_data(b"chunk").await;
        assert_eq!(t.get(1).await.unwrap(), Bytes::from_static(b"chunk"));
        assert!(!t.on_destination_closed().await);
    }

    #[tokio::test]
    async fn parked_reader_is_woken_with_closure() {
        let (t, _link) = tunnel(1024, DrainPolicy::Acknowledged);
        let reader = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.get(1).await })
        };
        wait_for_reader(&t).await;

        assert!(t.on_destination_closed().await);
        assert!(matches!(
            reader.await.unwrap(),
            Err(TunnelError::TunnelClosed)
        ));
    }

    #[tokio::test]
    async fn second_parked_reader_displaces_the_first() {
        let (t, _link) = tunnel(1024, DrainPolicy::Acknowledged);
        let first = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.get(1).await })
        };
        wait_for_reader(&t).await;
        let second = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.get(1).await })
        };

        assert!(matches!(
            first.await.unwrap(),
            Err(TunnelError::ReaderDisplaced)
        ));
        wait_for_reader(&t).await;
        t.on_destination_data(b"hello").await;
        assert_eq!(second.await.unwrap().unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn delete_closes_open_destination_after_queued_writes() {
        let (t, mut link) = tunnel(1024, DrainPolicy::Acknowledged);
        t.put(1, Bytes::from_static(b"bye")).await.unwrap();
        assert_eq!(t.delete().await, DeleteOutcome::Closing);

        assert!(matches!(
            link.commands.recv().await,
            Some(DestinationCommand::Write(_))
        ));
        assert!(matches!(
            link.commands.recv().await,
            Some(DestinationCommand::Close)
        ));

        // explicit delete ignores the replayable chunk
        t.on_destination_data(b"x").await;
        assert_eq!(t.get(1).await.unwrap(), Bytes::from_static(b"x"));
        assert!(t.on_destination_closed().await);
        assert_eq!(t.delete().await, DeleteOutcome::Removable);
    }

    #[tokio::test]
    async fn put_after_delete_is_refused() {
        let (t, mut link) = tunnel(1024, DrainPolicy::Acknowledged);
        t.put(1, Bytes::from_static(b"first")).await.unwrap();
        assert_eq!(t.delete().await, DeleteOutcome::Closing);

        assert!(matches!(
            t.put(2, Bytes::from_static(b"too late")).await,
            Err(TunnelError::TunnelClosed)
        ));
        // a retransmission of the applied write is still acknowledged
        assert_eq!(
            t.put(1, Bytes::from_static(b"first")).await.unwrap(),
            PutOutcome::Duplicate
        );
        assert_eq!(t.descriptor().await.seq_in, 1);

        assert!(matches!(
            link.commands.recv().await,
            Some(DestinationCommand::Write(_))
        ));
        assert!(matches!(
            link.commands.recv().await,
            Some(DestinationCommand::Close)
        ));
        assert!(link.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn delete_with_full_queue_returns_and_aborts_after_grace() {
        let settings = TunnelSettings {
            close_grace: Duration::from_millis(50),
            ..TunnelSettings::default()
        };
        let (t, mut link) = ServerTunnel::new("t-1".into(), "foobar".into(), 4242, 1, &settings);
        let mut seq = 1;
        while !t.command_queue_is_full() {
            t.put(seq, Bytes::from_static(b"x")).await.unwrap();
            seq += 1;
        }

        let outcome = tokio::time::timeout(Duration::from_secs(1), t.delete())
            .await
            .expect("delete must not wait on the write queue");
        assert_eq!(outcome, DeleteOutcome::Closing);

        tokio::time::timeout(Duration::from_secs(5), link.aborted.wait_for(|a| *a))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn delete_with_full_queue_still_closes_gracefully_if_drained_in_time() {
        let (t, mut link) = tunnel(1024, DrainPolicy::Acknowledged);
        let mut seq = 1;
        while !t.command_queue_is_full() {
            t.put(seq, Bytes::from_static(b"x")).await.unwrap();
            seq += 1;
        }
        assert_eq!(t.delete().await, DeleteOutcome::Closing);

        let mut writes = 0;
        loop {
            match link.commands.recv().await {
                Some(DestinationCommand::Write(_)) => writes += 1,
                Some(DestinationCommand::Close) => break,
                None => panic!("queue closed before Close arrived"),
            }
        }
        assert_eq!(writes, seq - 1);
        assert!(!*link.aborted.borrow());
    }

    #[tokio::test]
    async fn put_after_destination_closed_is_gone() {
        let (t, _link) = tunnel(1024, DrainPolicy::Acknowledged);
        t.on_destination_closed().await;
        assert!(matches!(
            t.put(1, Bytes::from_static(b"late")).await,
            Err(TunnelError::TunnelClosed)
        ));
        assert_eq!(t.descriptor().await.seq_in, 0);
    }
}
