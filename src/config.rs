// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : pnl_dash - live feed synchronization for a market-making bot dashboard
Module  : config.rs

Summary : Keeps ticker / orders / inventory push feeds and the polled daily
          PnL in sync with a backend, normalizes every payload, and exposes
          the latest value per topic to a display layer.
=============================================================================
*/
use std::env;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use thiserror::Error;
use url::Url;

use crate::channel::ChannelPolicy;

pub const DEFAULT_BACKEND: &str = "http://localhost:8000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid backend url `{url}`: {source}")]
    Backend { url: String, source: url::ParseError },
    #[error("cannot route `{path}` onto {base}: {source}")]
    Route { path: String, base: Url, source: url::ParseError },
}

/// Command-line overrides; anything left out falls back to the environment.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "pnl_dash", about = "Live trading-bot dashboard feeds")]
pub struct Cli {
    /// Backend base URL (env BACKEND_URL)
    #[arg(long)]
    pub backend_url: Option<String>,
    /// Prometheus / health port (env METRICS_PORT)
    #[arg(long)]
    pub metrics_port: Option<u16>,
    /// Daily PnL poll interval in ms (env PNL_POLL_MS)
    #[arg(long)]
    pub pnl_poll_ms: Option<u64>,
    /// tracing filter, e.g. "info,pnl_dash=debug" (env RUST_LOG)
    #[arg(long)]
    pub log: Option<String>,
}

/// Local path -> backend mapping (the /stream/*, /pnl, /health rewrites).
#[derive(Clone, Debug, PartialEq)]
pub struct Routes {
    pub backend: Url,
    pub ticker: String,
    pub orders: String,
    pub inventory: String,
    pub pnl: String,
    pub health: String,
}

impl Routes {
    pub fn new(backend: Url) -> Self {
        Self {
            backend,
            ticker: "/stream/ticker".into(),
            orders: "/stream/orders".into(),
            inventory: "/stream/pnl".into(),
            pnl: "/pnl".into(),
            health: "/health".into(),
        }
    }

    /// Absolute paths replace any path on the backend URL; that is how the
    /// rewrites are declared.
    pub fn resolve(&self, path: &str) -> Result<Url, ConfigError> {
        self.backend.join(path).map_err(|source| ConfigError::Route {
            path: path.to_string(),
            base: self.backend.clone(),
            source,
        })
    }

    pub fn ticker_url(&self) -> Result<Url, ConfigError> { self.resolve(&self.ticker) }
    pub fn orders_url(&self) -> Result<Url, ConfigError> { self.resolve(&self.orders) }
    pub fn inventory_url(&self) -> Result<Url, ConfigError> { self.resolve(&self.inventory) }
    pub fn pnl_url(&self) -> Result<Url, ConfigError> { self.resolve(&self.pnl) }
    pub fn health_url(&self) -> Result<Url, ConfigError> { self.resolve(&self.health) }
}

/// Everything the Supervisor needs to open its channels.
#[derive(Clone, Debug, PartialEq)]
pub struct FeedConfig {
    pub routes: Routes,
    pub pnl_poll: Duration,
    pub policy: ChannelPolicy,
}

impl FeedConfig {
    pub fn new(backend: Url) -> Self {
        Self { routes: Routes::new(backend), pnl_poll: Duration::from_millis(10_000), policy: ChannelPolicy::default() }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    pub feeds: FeedConfig,
    pub metrics_port: u16,
    pub log_filter: String,
}

/// Read .env + process environment, then apply CLI overrides.
pub fn load(cli: Cli) -> Result<Args, ConfigError> {
    // make sure .env is read before the lookups
    let _ = dotenv();
    from_lookup(cli, |k| env::var(k).ok())
}

fn parse_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// Same as `load` but with an injectable environment.
pub fn from_lookup(cli: Cli, lookup: impl Fn(&str) -> Option<String>) -> Result<Args, ConfigError> {
    // ===== Backend & routes =====
    let backend_raw = cli
        .backend_url
        .or_else(|| lookup("BACKEND_URL"))
        .unwrap_or_else(|| DEFAULT_BACKEND.to_string());
    let backend = Url::parse(backend_raw.trim())
        .map_err(|source| ConfigError::Backend { url: backend_raw.clone(), source })?;

    let mut routes = Routes::new(backend);
    if let Some(p) = lookup("TICKER_PATH") { routes.ticker = p; }
    if let Some(p) = lookup("ORDERS_PATH") { routes.orders = p; }
    if let Some(p) = lookup("INVENTORY_PATH") { routes.inventory = p; }
    if let Some(p) = lookup("PNL_PATH") { routes.pnl = p; }
    if let Some(p) = lookup("HEALTH_PATH") { routes.health = p; }

    // ===== Timing =====
    let poll_ms = cli.pnl_poll_ms.unwrap_or_else(|| parse_or(&lookup, "PNL_POLL_MS", 10_000u64)).max(1);
    let base_ms = parse_or(&lookup, "BACKOFF_BASE_MS", 1_000u64).max(1);
    let max_ms = parse_or(&lookup, "BACKOFF_MAX_MS", 30_000u64).max(base_ms);
    let fetch_ms = parse_or(&lookup, "FETCH_TIMEOUT_MS", 5_000u64).max(1);
    let connect_ms = parse_or(&lookup, "CONNECT_TIMEOUT_MS", 10_000u64).max(1);
    let idle_ms = parse_or(&lookup, "STREAM_IDLE_TIMEOUT_MS", 0u64);

    let policy = ChannelPolicy {
        backoff_base: Duration::from_millis(base_ms),
        backoff_max: Duration::from_millis(max_ms),
        idle_timeout: (idle_ms > 0).then(|| Duration::from_millis(idle_ms)),
        connect_timeout: Duration::from_millis(connect_ms),
        fetch_timeout: Duration::from_millis(fetch_ms),
    };

    // ===== Process =====
    let metrics_port = cli.metrics_port.unwrap_or_else(|| parse_or(&lookup, "METRICS_PORT", 9898u16));
    let log_filter = cli.log.or_else(|| lookup("RUST_LOG")).unwrap_or_else(|| "info".to_string());

    Ok(Args {
        feeds: FeedConfig { routes, pnl_poll: Duration::from_millis(poll_ms), policy },
        metrics_port,
        log_filter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| m.get(k).cloned()
    }

    #[test]
    fn defaults_match_the_backend_contract() {
        let a = from_lookup(Cli::default(), env_of(&[])).unwrap();
        let r = &a.feeds.routes;
        assert_eq!(r.ticker_url().unwrap().as_str(), "http://localhost:8000/stream/ticker");
        assert_eq!(r.orders_url().unwrap().as_str(), "http://localhost:8000/stream/orders");
        assert_eq!(r.inventory_url().unwrap().as_str(), "http://localhost:8000/stream/pnl");
        assert_eq!(r.pnl_url().unwrap().as_str(), "http://localhost:8000/pnl");
        assert_eq!(r.health_url().unwrap().as_str(), "http://localhost:8000/health");
        assert_eq!(a.feeds.pnl_poll, Duration::from_millis(10_000));
        assert_eq!(a.feeds.policy, ChannelPolicy::default());
        assert_eq!(a.metrics_port, 9898);
    }

    #[test]
    fn env_then_cli_overrides() {
        let env = env_of(&[
            ("BACKEND_URL", "https://bot.example.com"),
            ("PNL_POLL_MS", "2500"),
            ("BACKOFF_BASE_MS", "200"),
            ("BACKOFF_MAX_MS", "50"),
            ("STREAM_IDLE_TIMEOUT_MS", "15000"),
            ("METRICS_PORT", "not-a-port"),
        ]);
        let cli = Cli { pnl_poll_ms: Some(777), ..Cli::default() };
        let a = from_lookup(cli, env).unwrap();
        assert_eq!(a.feeds.routes.pnl_url().unwrap().as_str(), "https://bot.example.com/pnl");
        assert_eq!(a.feeds.pnl_poll, Duration::from_millis(777));
        assert_eq!(a.feeds.policy.backoff_base, Duration::from_millis(200));
        // cap never below base
        assert_eq!(a.feeds.policy.backoff_max, Duration::from_millis(200));
        assert_eq!(a.feeds.policy.idle_timeout, Some(Duration::from_secs(15)));
        assert_eq!(a.metrics_port, 9898);
    }

    #[test]
    fn bad_backend_is_an_error() {
        let cli = Cli { backend_url: Some("not a url".into()), ..Cli::default() };
        assert!(matches!(from_lookup(cli, env_of(&[])), Err(ConfigError::Backend { .. })));
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::parse_from(["pnl_dash", "--backend-url", "http://10.0.0.2:8000", "--metrics-port", "9000"]);
        assert_eq!(cli.backend_url.as_deref(), Some("http://10.0.0.2:8000"));
        assert_eq!(cli.metrics_port, Some(9000));
    }
}
