// ===============================
// src/supervisor.rs
// ===============================
//
// Supervisor: owns every channel of one dashboard activation.
//   ticker / orders / inventory -> StreamChannel
//   daily pnl                   -> PollChannel
// All sinks write straight into the StateStore. deactivate() (or drop)
// closes everything; after it returns the store receives no more writes.
//
// Dashboard: the single-active-supervisor holder.
//
use thiserror::Error;
use tracing::info;

use crate::channel::{ChannelState, FeedError};
use crate::config::{ConfigError, FeedConfig};
use crate::domain::{DailyPnl, InventorySnapshot, OrderBook, TickerSample, Topic};
use crate::normalize::Normalize;
use crate::poll::PollChannel;
use crate::store::StateStore;
use crate::stream::StreamChannel;

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("dashboard is already active")]
    AlreadyActive,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Feed(#[from] FeedError),
}

pub struct Supervisor {
    streams: Vec<StreamChannel>,
    polls: Vec<PollChannel>,
}

fn push_channel<T: Normalize>(
    url: url::Url,
    store: &StateStore,
    cfg: &FeedConfig,
) -> Result<StreamChannel, FeedError> {
    let store = store.clone();
    StreamChannel::open::<T, _>(url, move |v: T| store.publish(v), cfg.policy.clone())
}

impl Supervisor {
    /// Open one channel per topic. If any channel fails to open, the ones
    /// already opened are closed again (dropped) before the error returns.
    pub fn activate(cfg: &FeedConfig, store: &StateStore) -> Result<Self, DashboardError> {
        let routes = &cfg.routes;
        let mut sup = Supervisor { streams: Vec::with_capacity(3), polls: Vec::with_capacity(1) };

        sup.streams.push(push_channel::<TickerSample>(routes.ticker_url()?, store, cfg)?);
        sup.streams.push(push_channel::<OrderBook>(routes.orders_url()?, store, cfg)?);
        sup.streams.push(push_channel::<InventorySnapshot>(routes.inventory_url()?, store, cfg)?);

        let pnl_store = store.clone();
        sup.polls.push(PollChannel::open::<DailyPnl, _>(
            routes.pnl_url()?,
            cfg.pnl_poll,
            move |v: DailyPnl| pnl_store.publish(v),
            cfg.policy.clone(),
        )?);

        info!(backend = %routes.backend, pnl_poll = ?cfg.pnl_poll, "supervisor active");
        Ok(sup)
    }

    /// Close every channel. Synchronous: no store write happens after return.
    pub fn deactivate(mut self) { self.close_all(); }

    fn close_all(&mut self) {
        if self.streams.is_empty() && self.polls.is_empty() {
            return;
        }
        for ch in &mut self.streams {
            ch.close();
        }
        for ch in &mut self.polls {
            ch.close();
        }
        self.streams.clear();
        self.polls.clear();
        info!("supervisor deactivated");
    }

    pub fn channel_states(&self) -> Vec<(Topic, ChannelState)> {
        self.streams
            .iter()
            .map(|c| (c.topic(), c.state()))
            .chain(self.polls.iter().map(|c| (c.topic(), c.state())))
            .collect()
    }

    pub fn channel_count(&self) -> usize { self.streams.len() + self.polls.len() }
}

impl Drop for Supervisor {
    fn drop(&mut self) { self.close_all(); }
}

/// One dashboard instance: a store plus at most one running Supervisor.
pub struct Dashboard {
    store: StateStore,
    cfg: FeedConfig,
    active: Option<Supervisor>,
}

impl Dashboard {
    pub fn new(cfg: FeedConfig) -> Self { Self::with_store(cfg, StateStore::new()) }

    pub fn with_store(cfg: FeedConfig, store: StateStore) -> Self { Self { store, cfg, active: None } }

    /// Build fresh channels. Fails while a previous activation is still running.
    pub fn activate(&mut self) -> Result<(), DashboardError> {
        if self.active.is_some() {
            return Err(DashboardError::AlreadyActive);
        }
        self.active = Some(Supervisor::activate(&self.cfg, &self.store)?);
        Ok(())
    }

    /// Idempotent.
    pub fn deactivate(&mut self) {
        if let Some(sup) = self.active.take() {
            sup.deactivate();
        }
    }

    pub fn is_active(&self) -> bool { self.active.is_some() }

    pub fn store(&self) -> &StateStore { &self.store }

    pub fn channel_states(&self) -> Vec<(Topic, ChannelState)> {
        self.active.as_ref().map(Supervisor::channel_states).unwrap_or_default()
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) { self.deactivate(); }
}
