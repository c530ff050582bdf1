// ===============================
// src/poll.rs
// ===============================
//
// PollChannel: periodic GET for one topic (the daily PnL endpoint).
// - first fetch immediately, then every `interval`
// - a single task awaits each fetch before the next tick, so fetches never
//   overlap; ticks that come due meanwhile are skipped
// - failures are logged, the schedule keeps going
//
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::channel::{ingest, ChannelPolicy, ChannelState, FeedError, Gate, Sink, StateCell};
use crate::domain::Topic;
use crate::metrics::{POLL_SKIPPED, REJECTS};
use crate::normalize::Normalize;
use crate::transport::fetch_body;

pub struct PollChannel {
    topic: Topic,
    url: Url,
    state: StateCell,
    gate: Gate,
    task: Option<JoinHandle<()>>,
}

impl PollChannel {
    pub fn open<T, S>(url: Url, every: Duration, sink: S, policy: ChannelPolicy) -> Result<Self, FeedError>
    where
        T: Normalize,
        S: Sink<T>,
    {
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(FeedError::Transport(format!("cannot poll `{other}` url {url}"))),
        }
        if every.is_zero() {
            return Err(FeedError::Transport("poll interval must be > 0".into()));
        }
        let http = reqwest::Client::builder().connect_timeout(policy.connect_timeout).build()?;
        let state = StateCell::new();
        let gate = Gate::new();
        let task = tokio::spawn(run::<T>(
            http,
            url.clone(),
            every,
            Arc::new(sink),
            policy.fetch_timeout,
            state.clone(),
            gate.clone(),
        ));
        Ok(Self { topic: T::TOPIC, url, state, gate, task: Some(task) })
    }

    /// Cancel the timer and any in-flight request. Idempotent.
    pub fn close(&mut self) {
        self.gate.shut();
        if let Some(task) = self.task.take() {
            task.abort();
            info!(topic = %self.topic, url = %self.url, "poll channel closed");
        }
        self.state.set(ChannelState::Closed);
    }

    pub fn topic(&self) -> Topic { self.topic }

    pub fn url(&self) -> &Url { &self.url }

    pub fn state(&self) -> ChannelState { self.state.get() }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> { self.state.subscribe() }
}

impl Drop for PollChannel {
    fn drop(&mut self) { self.close(); }
}

async fn run<T: Normalize>(
    http: reqwest::Client,
    url: Url,
    every: Duration,
    sink: Arc<dyn Sink<T>>,
    fetch_timeout: Duration,
    state: StateCell,
    gate: Gate,
) {
    let topic = T::TOPIC;
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let due = tick.tick().await; // first tick completes immediately
        if !state.set(ChannelState::Connecting) && state.get() == ChannelState::Closed {
            return;
        }
        let result = match fetch_body(&http, &url, fetch_timeout).await {
            Ok(body) => ingest::<T>(&body),
            Err(e) => {
                REJECTS.with_label_values(&[topic.name(), e.kind()]).inc();
                Err(e)
            }
        };
        match result {
            Ok(record) => {
                if !gate.deliver(&*sink, record) {
                    return;
                }
                state.set(ChannelState::Open);
            }
            Err(e) => {
                warn!(topic = %topic, %url, kind = e.kind(), error = %e, "poll failed, keeping schedule");
                state.set(ChannelState::Error);
            }
        }

        // ticks that came due while the fetch was in flight are dropped;
        // the schedule stays on the original grid
        let late = Instant::now().saturating_duration_since(due);
        let skipped = (late.as_nanos() / every.as_nanos()).min(u32::MAX as u128) as u32;
        if skipped > 0 {
            POLL_SKIPPED.inc_by(u64::from(skipped));
            debug!(topic = %topic, skipped, "fetch outlived the interval, skipping ticks");
            tick.reset_at(due + every.saturating_mul(skipped.saturating_add(1)));
        }
    }
}
