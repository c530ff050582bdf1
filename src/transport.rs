// ===============================
// src/transport.rs
// ===============================
//
// Wire adapters:
// - Sse       : GET with Accept: text/event-stream, body decoded by sse.rs
// - WebSocket : tokio-tungstenite, one text frame = one message
// - fetch_body: one-shot GET for the polled /pnl endpoint
//
use std::collections::VecDeque;
use std::time::Duration;

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;
use url::Url;

use crate::channel::FeedError;
use crate::domain::Topic;
use crate::metrics::REJECTS;
use crate::sse::SseDecoder;

/// One push message before decoding. `id` is only set by SSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: Option<String>,
    pub data: String,
}

pub type MessageStream = BoxStream<'static, Result<RawMessage, FeedError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushTransport {
    Sse,
    WebSocket,
}

impl PushTransport {
    /// http(s) -> SSE, ws(s) -> WebSocket.
    pub fn for_url(url: &Url) -> Result<Self, FeedError> {
        match url.scheme() {
            "http" | "https" => Ok(PushTransport::Sse),
            "ws" | "wss" => Ok(PushTransport::WebSocket),
            other => Err(FeedError::Transport(format!("unsupported scheme `{other}` in {url}"))),
        }
    }

    pub async fn connect(
        &self,
        http: &reqwest::Client,
        url: &Url,
        topic: Topic,
        last_event_id: Option<&str>,
    ) -> Result<MessageStream, FeedError> {
        match self {
            PushTransport::Sse => connect_sse(http, url, last_event_id).await,
            PushTransport::WebSocket => connect_ws(url, topic).await,
        }
    }
}

/// Client for push streams: no overall timeout, the body never ends.
/// Keepalive probes let the OS notice a peer that vanished while idle.
pub fn stream_client(connect_timeout: Duration) -> Result<reqwest::Client, FeedError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .tcp_keepalive(Duration::from_secs(30))
        .build()?)
}

pub async fn connect_sse(
    http: &reqwest::Client,
    url: &Url,
    last_event_id: Option<&str>,
) -> Result<MessageStream, FeedError> {
    let mut req = http
        .get(url.clone())
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache");
    if let Some(id) = last_event_id {
        req = req.header("Last-Event-ID", id);
    }
    let rsp = req.send().await?;
    let status = rsp.status();
    if !status.is_success() {
        return Err(FeedError::Transport(format!("{url} answered {status}")));
    }
    let ctype = rsp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if !ctype.starts_with("text/event-stream") {
        return Err(FeedError::Transport(format!("{url} is not an event stream (content-type `{ctype}`)")));
    }

    let body = Box::pin(rsp.bytes_stream());
    let events = stream::unfold(
        (body, SseDecoder::new(), VecDeque::new()),
        |(mut body, mut dec, mut pending)| async move {
            loop {
                if let Some(ev) = pending.pop_front() {
                    return Some((Ok(ev), (body, dec, pending)));
                }
                match body.next().await {
                    Some(Ok(chunk)) => {
                        pending.extend(dec.push(&chunk).into_iter().map(|e| RawMessage { id: e.id, data: e.data }));
                    }
                    Some(Err(e)) => return Some((Err(FeedError::from(e)), (body, dec, pending))),
                    None => return None,
                }
            }
        },
    );
    Ok(events.boxed())
}

pub async fn connect_ws(url: &Url, topic: Topic) -> Result<MessageStream, FeedError> {
    let (ws, _resp) = connect_async(url.as_str()).await?;
    let frames = ws.filter_map(move |frame| async move {
        match frame {
            Ok(Message::Text(t)) => Some(Ok(RawMessage { id: None, data: t })),
            Ok(Message::Binary(b)) => match String::from_utf8(b) {
                Ok(t) => Some(Ok(RawMessage { id: None, data: t })),
                Err(e) => {
                    warn!(topic = %topic, error = %e, "binary frame is not UTF-8, dropping");
                    REJECTS.with_label_values(&[topic.name(), "decode"]).inc();
                    None
                }
            },
            Ok(_) => None, // ping/pong/close handled by tungstenite
            Err(e) => Some(Err(FeedError::from(e))),
        }
    });
    Ok(frames.boxed())
}

/// One-shot GET returning the raw body. Non-2xx is a transport error.
pub async fn fetch_body(http: &reqwest::Client, url: &Url, timeout: Duration) -> Result<Vec<u8>, FeedError> {
    let rsp = http
        .get(url.clone())
        .header(ACCEPT, "application/json")
        .timeout(timeout)
        .send()
        .await?;
    let status = rsp.status();
    if !status.is_success() {
        return Err(FeedError::Transport(format!("{url} answered {status}")));
    }
    Ok(rsp.bytes().await?.to_vec())
}
