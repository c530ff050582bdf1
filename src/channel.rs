// ===============================
// src/channel.rs
// ===============================
//
// Pieces shared by stream.rs and poll.rs:
// - FeedError        : transport / decode / validation taxonomy
// - ChannelState     : Idle -> Connecting -> Open -> (Error -> Connecting)* -> Closed
// - Gate             : delivery happens under the gate; close() shuts it first,
//                      so nothing reaches the sink after close() returns
// - Backoff          : exponential reconnect delay + jitter
// - ingest()         : raw text -> JSON -> Normalizer, with logging + metrics
//
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::metrics::{MESSAGES, REJECTS};
use crate::normalize::{Normalize, ValidationError};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),
}

impl FeedError {
    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedError::Transport(_) => "transport",
            FeedError::Decode(_) => "decode",
            FeedError::Validation(_) => "validation",
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self { FeedError::Transport(e.to_string()) }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self { FeedError::Transport(e.to_string()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Error,
    Closed,
}

/// Observable channel state. `Closed` is terminal.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<watch::Sender<ChannelState>>);

impl StateCell {
    pub fn new() -> Self { Self(Arc::new(watch::channel(ChannelState::Idle).0)) }

    /// Returns false when the transition was refused (already Closed) or a no-op.
    pub fn set(&self, next: ChannelState) -> bool {
        self.0.send_if_modified(|cur| {
            if *cur == ChannelState::Closed || *cur == next {
                return false;
            }
            *cur = next;
            true
        })
    }

    pub fn get(&self) -> ChannelState { *self.0.borrow() }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> { self.0.subscribe() }
}

impl Default for StateCell {
    fn default() -> Self { Self::new() }
}

/// Where validated records go.
pub trait Sink<T>: Send + Sync + 'static {
    fn deliver(&self, value: T);
}

impl<T, F> Sink<T> for F
where
    F: Fn(T) + Send + Sync + 'static,
{
    fn deliver(&self, value: T) { self(value) }
}

/// Delivery gate. A sink call runs while the lock is held, so once `shut`
/// returns no call is in progress and none can start.
///
/// The sink must not close its own channel from inside `deliver`.
#[derive(Debug, Clone)]
pub struct Gate(Arc<Mutex<bool>>);

impl Gate {
    pub fn new() -> Self { Self(Arc::new(Mutex::new(true))) }

    pub fn deliver<T, S: Sink<T> + ?Sized>(&self, sink: &S, value: T) -> bool {
        let open = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *open {
            sink.deliver(value);
        }
        *open
    }

    pub fn shut(&self) { *self.0.lock().unwrap_or_else(PoisonError::into_inner) = false; }

    pub fn is_open(&self) -> bool { *self.0.lock().unwrap_or_else(PoisonError::into_inner) }
}

impl Default for Gate {
    fn default() -> Self { Self::new() }
}

/// Reconnect / fetch tuning shared by all channels.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPolicy {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Drop a push connection after this long without a message.
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            idle_timeout: None,
            connect_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

/// Exponential backoff: base, 2*base, 4*base ... capped at max, plus up to
/// 25% jitter (never past max).
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self { base, max, current: base }
    }

    pub fn next_delay(&mut self) -> Duration {
        let d = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        let jitter_ms = (d.as_millis() / 4) as u64;
        let jitter = if jitter_ms > 0 { rand::thread_rng().gen_range(0..=jitter_ms) } else { 0 };
        (d + Duration::from_millis(jitter)).min(self.max)
    }

    pub fn reset(&mut self) { self.current = self.base; }

    /// Undelayed next step, for logs and tests.
    pub fn peek(&self) -> Duration { self.current }
}

/// Decode one raw payload and run it through the Normalizer for `T`.
pub fn ingest<T: Normalize>(payload: &[u8]) -> Result<T, FeedError> {
    let topic = T::TOPIC;
    let raw: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            REJECTS.with_label_values(&[topic.name(), "decode"]).inc();
            return Err(e.into());
        }
    };
    match T::normalize(&raw) {
        Ok(n) => {
            for (idx, e) in &n.dropped {
                warn!(topic = %topic, idx, error = %e, "dropping invalid element");
                REJECTS.with_label_values(&[topic.name(), "element"]).inc();
            }
            MESSAGES.with_label_values(&[topic.name()]).inc();
            debug!(topic = %topic, "message normalized");
            Ok(n.value)
        }
        Err(e) => {
            REJECTS.with_label_values(&[topic.name(), "validation"]).inc();
            Err(e.into())
        }
    }
}
