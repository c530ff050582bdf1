// ===============================
// src/stream.rs
// ===============================
//
// StreamChannel: one push subscription (SSE or WebSocket) for one topic.
//
// Loop per connection:
//   Connecting -> Open -> read messages -> drop / error -> Error
//   -> backoff sleep -> Connecting ...
// Backoff resets after every message that reaches the sink.
// Getting a response (SSE headers / WS handshake) is bounded by
// connect_timeout; a stalled connect counts as a transport error.
//
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use prometheus::IntGauge;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use url::Url;

use crate::channel::{ingest, Backoff, ChannelPolicy, ChannelState, FeedError, Gate, Sink, StateCell};
use crate::domain::Topic;
use crate::metrics::{CONNECTED, RECONNECTS};
use crate::normalize::Normalize;
use crate::transport::{stream_client, PushTransport};

pub struct StreamChannel {
    topic: Topic,
    url: Url,
    state: StateCell,
    gate: Gate,
    task: Option<JoinHandle<()>>,
}

impl StreamChannel {
    /// Start the subscription for `T::TOPIC`. Must be called inside a tokio runtime.
    pub fn open<T, S>(url: Url, sink: S, policy: ChannelPolicy) -> Result<Self, FeedError>
    where
        T: Normalize,
        S: Sink<T>,
    {
        let transport = PushTransport::for_url(&url)?;
        let http = stream_client(policy.connect_timeout)?;
        let state = StateCell::new();
        let gate = Gate::new();
        let task = tokio::spawn(run::<T>(
            transport,
            http,
            url.clone(),
            Arc::new(sink),
            policy,
            state.clone(),
            gate.clone(),
        ));
        Ok(Self { topic: T::TOPIC, url, state, gate, task: Some(task) })
    }

    /// Stop the subscription. Idempotent; the sink is never called after this returns.
    pub fn close(&mut self) {
        self.gate.shut();
        if let Some(task) = self.task.take() {
            task.abort();
            CONNECTED.with_label_values(&[self.topic.name()]).set(0);
            info!(topic = %self.topic, url = %self.url, "stream channel closed");
        }
        self.state.set(ChannelState::Closed);
    }

    pub fn topic(&self) -> Topic { self.topic }

    pub fn url(&self) -> &Url { &self.url }

    pub fn state(&self) -> ChannelState { self.state.get() }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> { self.state.subscribe() }
}

impl Drop for StreamChannel {
    fn drop(&mut self) { self.close(); }
}

/// Holds the connected gauge at 1; dropping it (end of connection or an
/// aborted task) puts it back to 0.
struct LiveGauge(IntGauge);

impl LiveGauge {
    fn raise(gauge: IntGauge) -> Self {
        gauge.set(1);
        Self(gauge)
    }
}

impl Drop for LiveGauge {
    fn drop(&mut self) { self.0.set(0); }
}

async fn run<T: Normalize>(
    transport: PushTransport,
    http: reqwest::Client,
    url: Url,
    sink: Arc<dyn Sink<T>>,
    policy: ChannelPolicy,
    state: StateCell,
    gate: Gate,
) {
    let topic = T::TOPIC;
    let mut backoff = Backoff::new(policy.backoff_base, policy.backoff_max);
    let mut last_event_id: Option<String> = None;

    loop {
        if !state.set(ChannelState::Connecting) && state.get() == ChannelState::Closed {
            return;
        }
        info!(topic = %topic, %url, "connecting");
        let connecting = transport.connect(&http, &url, topic, last_event_id.as_deref());
        let connected = match timeout(policy.connect_timeout, connecting).await {
            Ok(r) => r,
            Err(_) => Err(FeedError::Transport(format!(
                "no response from {url} within {:?}",
                policy.connect_timeout
            ))),
        };
        match connected {
            Ok(mut messages) => {
                state.set(ChannelState::Open);
                let _live = LiveGauge::raise(CONNECTED.with_label_values(&[topic.name()]));
                info!(topic = %topic, "stream open");

                loop {
                    let next = match policy.idle_timeout {
                        Some(idle) => match timeout(idle, messages.next()).await {
                            Ok(n) => n,
                            Err(_) => {
                                warn!(topic = %topic, ?idle, "no message within idle timeout, dropping connection");
                                break;
                            }
                        },
                        None => messages.next().await,
                    };
                    match next {
                        Some(Ok(msg)) => {
                            if msg.id.is_some() {
                                last_event_id = msg.id;
                            }
                            if msg.data.trim().is_empty() {
                                continue;
                            }
                            match ingest::<T>(msg.data.as_bytes()) {
                                Ok(record) => {
                                    if !gate.deliver(&*sink, record) {
                                        return;
                                    }
                                    backoff.reset();
                                }
                                Err(e) => warn!(topic = %topic, kind = e.kind(), error = %e, "dropping message"),
                            }
                        }
                        Some(Err(e)) => {
                            warn!(topic = %topic, error = %e, "stream read error");
                            break;
                        }
                        None => {
                            info!(topic = %topic, "stream ended by server");
                            break;
                        }
                    }
                }
            }
            Err(e) => error!(topic = %topic, error = %e, "connect failed"),
        }

        if !gate.is_open() {
            return;
        }
        state.set(ChannelState::Error);
        RECONNECTS.with_label_values(&[topic.name()]).inc();
        let delay = backoff.next_delay();
        info!(topic = %topic, ?delay, "will reconnect");
        sleep(delay).await;
    }
}
