// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::info;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feed traffic --------
pub static MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("feed_messages_total", "messages that passed normalization (label: topic)"),
        &["topic"],
    )
    .unwrap()
});

pub static REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "feed_rejects_total",
            "dropped payloads (labels: topic, kind = decode|validation|element|transport)",
        ),
        &["topic", "kind"],
    )
    .unwrap()
});

// -------- Channel health --------
pub static CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("feed_connected", "1 if the push channel is open, 0 otherwise"),
        &["topic"],
    )
    .unwrap()
});

pub static RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("feed_reconnects_total", "reconnect attempts per push channel"),
        &["topic"],
    )
    .unwrap()
});

pub static POLL_SKIPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("poll_ticks_skipped_total", "poll ticks skipped because a fetch was in flight").unwrap()
});

// -------- Read model --------
pub static PUBLISHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("store_publishes_total", "store writes per topic"), &["topic"]).unwrap()
});

pub static LAST_UPDATE_TS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("store_last_update_ts", "Unix seconds of the last store write per topic"),
        &["topic"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; a second call is a no-op
    for m in [
        REGISTRY.register(Box::new(MESSAGES.clone())),
        REGISTRY.register(Box::new(REJECTS.clone())),
        REGISTRY.register(Box::new(CONNECTED.clone())),
        REGISTRY.register(Box::new(RECONNECTS.clone())),
        REGISTRY.register(Box::new(POLL_SKIPPED.clone())),
        REGISTRY.register(Box::new(PUBLISHES.clone())),
        REGISTRY.register(Box::new(LAST_UPDATE_TS.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let rsp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") | (&Method::GET, "/metrics") => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        (&Method::GET, "/health") => Response::builder().body(Body::from("ok\n")),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()),
    };
    Ok(rsp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serve /metrics and /health until the task is dropped.
pub async fn serve_metrics(port: u16) -> Result<(), hyper::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!(%addr, "metrics listening on /metrics (and /health)");
    server.await
}
