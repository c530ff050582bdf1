#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::body::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use url::Url;

use pnl_dash::ChannelPolicy;

/// In-process HTTP backend on 127.0.0.1:<random>.
pub struct MockServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn spawn<F, Fut>(handler: F) -> Self
    where
        F: Fn(Request<Body>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Response<Body>> + Send + 'static,
    {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        listener.set_nonblocking(true).expect("nonblocking");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let make_svc = make_service_fn(move |_| {
            let handler = handler.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                }))
            }
        });
        let server = Server::from_tcp(listener).expect("server").serve(make_svc);
        let handle = tokio::spawn(async move {
            let _ = server
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
        Self { addr, shutdown_tx: Some(shutdown_tx), handle }
    }

    pub fn base_url(&self) -> Url { Url::parse(&format!("http://{}", self.addr)).unwrap() }

    pub fn url(&self, path: &str) -> Url { self.base_url().join(path).unwrap() }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

/// `data: <payload>` frame, optionally with an id.
pub fn event(data: &str, id: Option<&str>) -> String {
    match id {
        Some(id) => format!("id: {id}\ndata: {data}\n\n"),
        None => format!("data: {data}\n\n"),
    }
}

/// Event-stream response that writes `frames` with `gap` between them and
/// then either ends the body (a transport drop) or holds it open.
pub fn sse(frames: Vec<String>, gap: Duration, hold_open: bool) -> Response<Body> {
    let (mut tx, body) = Body::channel();
    tokio::spawn(async move {
        for f in frames {
            if tx.send_data(Bytes::from(f)).await.is_err() {
                return;
            }
            sleep(gap).await;
        }
        if hold_open {
            sleep(Duration::from_secs(3600)).await;
        }
        drop(tx);
    });
    Response::builder()
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .unwrap()
}

pub fn json(status: StatusCode, body: impl Into<String>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.into()))
        .unwrap()
}

/// Poll `cond` every 10ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Fast reconnects for tests.
pub fn fast_policy() -> ChannelPolicy {
    ChannelPolicy {
        backoff_base: Duration::from_millis(20),
        backoff_max: Duration::from_millis(80),
        idle_timeout: None,
        connect_timeout: Duration::from_millis(500),
        fetch_timeout: Duration::from_secs(2),
    }
}
