//! Sequencing and bounded-retry rules for the polling transport.
//!
//! These types hold no I/O. The reader and writer tasks feed them response
//! statuses and transport failures, and they answer with a [`Step`]:
//! advance to the next sequence, retry the same one after a delay, or stop.
//!
//! | Operation | Success                 | Terminal without retry |
//! |-----------|-------------------------|------------------------|
//! | open      | 200, 201, 204           | none                   |
//! | read      | 200                     | 404, 410               |
//! | write     | 200, 201, 202, 204      | 404, 410               |
//! | delete    | 200, 202, 204, 404, 410 | none                   |
//!
//! Anything else counts as a transport failure and is retried until
//! `max_retries` consecutive failures.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use reqwest::StatusCode;

use crate::config::RetryConfig;
use crate::error::CloseReason;

/// Tunnel operations, each with its own status rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Open,
    Read,
    Write,
    Delete,
}

/// How one response status is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The tunnel no longer exists on the server.
    Gone,
    Transient,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }

    pub fn classify(self, status: StatusCode) -> Outcome {
        match (self, status.as_u16()) {
            (Self::Open, 200 | 201 | 204)
            | (Self::Read, 200)
            | (Self::Write, 200 | 201 | 202 | 204)
            | (Self::Delete, 200 | 202 | 204 | 404 | 410) => Outcome::Success,
            (Self::Read | Self::Write, 404 | 410) => Outcome::Gone,
            _ => Outcome::Transient,
        }
    }
}

/// Backoff schedule shared by every operation of one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the retry that follows `failures` consecutive failures:
    /// `base_delay * 2^(failures-1)`, capped at `max_delay`.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Consecutive-failure counter for one operation.
#[derive(Debug, Clone)]
pub struct Attempts {
    op: Op,
    policy: RetryPolicy,
    failures: u32,
}

impl Attempts {
    pub fn new(op: Op, policy: RetryPolicy) -> Self {
        Self {
            op,
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Record a failure. Returns the backoff before the next attempt, or the
    /// terminal reason once the budget is spent.
    pub fn fail(&mut self) -> Result<Duration, CloseReason> {
        self.failures += 1;
        if self.failures >= self.policy.max_retries {
            Err(CloseReason::RetriesExhausted { op: self.op.name() })
        } else {
            Ok(self.policy.delay(self.failures))
        }
    }
}

/// What the transport task does next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The attempt succeeded and the sequence moved on.
    Advance,
    /// Repeat the same sequence after this delay.
    Retry(Duration),
    Close(CloseReason),
}

/// Drives `GET out/{seq}`.
#[derive(Debug, Clone)]
pub struct ReadSequencer {
    seq: u64,
    attempts: Attempts,
}

impl ReadSequencer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            seq: 1,
            attempts: Attempts::new(Op::Read, policy),
        }
    }

    /// Sequence the next GET must ask for.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn on_status(&mut self, status: StatusCode) -> Step {
        match Op::Read.classify(status) {
            Outcome::Success => {
                self.seq += 1;
                self.attempts.reset();
                Step::Advance
            }
            Outcome::Gone => Step::Close(CloseReason::Remote),
            Outcome::Transient => self.retry(),
        }
    }

    pub fn on_transport_error(&mut self) -> Step {
        self.retry()
    }

    fn retry(&mut self) -> Step {
        match self.attempts.fail() {
            Ok(delay) => Step::Retry(delay),
            Err(reason) => Step::Close(reason),
        }
    }
}

/// Drives `PUT in/{seq}` with a coalescing buffer.
///
/// Bytes queued while a PUT is in flight wait in `buffer` and go out together
/// under the next sequence. A retried PUT always carries exactly the bytes of
/// its first attempt.
#[derive(Debug, Clone)]
pub struct WriteSequencer {
    seq: u64,
    buffer: BytesMut,
    in_flight: Option<Bytes>,
    max_put_bytes: usize,
    closing: bool,
    attempts: Attempts,
}

impl WriteSequencer {
    pub fn new(policy: RetryPolicy, max_put_bytes: usize) -> Self {
        Self {
            seq: 1,
            buffer: BytesMut::new(),
            in_flight: None,
            max_put_bytes: max_put_bytes.max(1),
            closing: false,
            attempts: Attempts::new(Op::Write, policy),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn queue(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Nothing in flight and nothing buffered.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.buffer.is_empty()
    }

    /// Stop issuing PUTs, retries included.
    pub fn close(&mut self) {
        self.closing = true;
    }

    /// The PUT to issue now: the unacknowledged one again, or up to
    /// `max_put_bytes` fresh bytes from the buffer.
    pub fn next_put(&mut self) -> Option<(u64, Bytes)> {
        if self.closing {
            return None;
        }
        if let Some(body) = &self.in_flight {
            return Some((self.seq, body.clone()));
        }
        if self.buffer.is_empty() {
            return None;
        }
        let take = self.buffer.len().min(self.max_put_bytes);
        let body = self.buffer.split_to(take).freeze();
        self.in_flight = Some(body.clone());
        Some((self.seq, body))
    }

    pub fn on_status(&mut self, status: StatusCode) -> Step {
        match Op::Write.classify(status) {
            Outcome::Success => {
                self.in_flight = None;
                self.seq += 1;
                self.attempts.reset();
                Step::Advance
            }
            Outcome::Gone => Step::Close(CloseReason::Remote),
            Outcome::Transient => self.retry(),
        }
    }

    pub fn on_transport_error(&mut self) -> Step {
        self.retry()
    }

    fn retry(&mut self) -> Step {
        match self.attempts.fail() {
            Ok(delay) => Step::Retry(delay),
            Err(reason) => Step::Close(reason),
        }
    }
}
