// ===============================
// src/main.rs
// ===============================
/*
 # run against a local backend
 BACKEND_URL=http://localhost:8000 cargo run --release

 # feed health
 curl -s localhost:9898/metrics | egrep '^feed_(connected|reconnects_total|rejects_total)'
*/
/*
=============================================================================
Project : pnl_dash - live feed synchronization for a market-making bot dashboard
Module  : main.rs

Summary : Keeps ticker / orders / inventory push feeds and the polled daily
          PnL in sync with a backend, normalizes every payload, and exposes
          the latest value per topic to a display layer.
=============================================================================
*/
use std::time::Duration;

use clap::Parser;
use tokio::{select, time::interval};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pnl_dash::config::{self, Cli};
use pnl_dash::{metrics, Dashboard, Snapshot, StateStore, Topic};

/// One display line per update, same precision as the web cards.
fn describe(s: &Snapshot) -> String {
    match s {
        Snapshot::Ticker(t) => format!("BTC {:.5} (bid {:.5} / ask {:.5})", t.mid, t.bid, t.ask),
        Snapshot::Inventory(i) => {
            format!("equity {:.2} | cash {:.2} | inventory {:.2}", i.equity, i.cash, i.inventory)
        }
        Snapshot::Orders(b) => {
            let rows: Vec<String> = b
                .orders
                .iter()
                .map(|o| format!("{} {} @ {:.5} x {:.5}", o.oid, o.side.as_str(), o.px, o.qty))
                .collect();
            format!("{} active [{}]", b.len(), rows.join("; "))
        }
        Snapshot::DailyPnl(p) => format!(
            "{} pnl equity {:.2} (realised {:.2}, unrealised {:.2})",
            p.day, p.equity, p.realised, p.unrealised
        ),
    }
}

async fn probe_health(url: url::Url) {
    let http = reqwest::Client::new();
    match http.get(url.clone()).timeout(Duration::from_secs(3)).send().await {
        Ok(rsp) if rsp.status().is_success() => info!(%url, "backend healthy"),
        Ok(rsp) => warn!(%url, status = %rsp.status(), "backend health probe failed"),
        Err(e) => warn!(%url, error = %e, "backend unreachable, feeds will keep retrying"),
    }
}

#[tokio::main]
async fn main() {
    // ---- Load config ----
    let args = match config::load(Cli::parse()) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(2);
        }
    };

    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Metrics ----
    metrics::init();
    let port = args.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::serve_metrics(port).await {
            error!(?e, port, "metrics server stopped");
        }
    });

    let routes = &args.feeds.routes;
    info!(
        backend = %routes.backend,
        ticker = %routes.ticker,
        orders = %routes.orders,
        inventory = %routes.inventory,
        pnl = %routes.pnl,
        pnl_poll = ?args.feeds.pnl_poll,
        backoff_base = ?args.feeds.policy.backoff_base,
        backoff_max = ?args.feeds.policy.backoff_max,
        "startup config"
    );

    if let Ok(url) = routes.health_url() {
        tokio::spawn(probe_health(url));
    }

    // ---- Channels ----
    let store = StateStore::new();
    let mut dash = Dashboard::with_store(args.feeds.clone(), store.clone());
    if let Err(e) = dash.activate() {
        error!(error = %e, "cannot activate dashboard");
        std::process::exit(1);
    }

    // ---- Display loop ----
    let mut ticker_rx = store.watch(Topic::Ticker);
    let mut orders_rx = store.watch(Topic::Orders);
    let mut inv_rx = store.watch(Topic::Inventory);
    let mut pnl_rx = store.watch(Topic::DailyPnl);
    let mut heartbeat = interval(Duration::from_secs(30));

    loop {
        let changed = select! {
            Ok(()) = ticker_rx.changed() => ticker_rx.borrow_and_update().clone(),
            Ok(()) = orders_rx.changed() => orders_rx.borrow_and_update().clone(),
            Ok(()) = inv_rx.changed() => inv_rx.borrow_and_update().clone(),
            Ok(()) = pnl_rx.changed() => pnl_rx.borrow_and_update().clone(),
            _ = heartbeat.tick() => {
                info!(channels = ?dash.channel_states(), "heartbeat");
                None
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        };
        if let Some(p) = changed {
            info!(topic = %p.snapshot.topic(), "{}", describe(&p.snapshot));
        }
    }

    dash.deactivate();
    info!("bye");
}
