// ===============================
// src/lib.rs
// ===============================
//
// Live feed synchronization for the trading-bot dashboard.
//
//   normalize  : wire JSON -> typed records (pure)
//   sse        : text/event-stream decoder
//   transport  : SSE / WebSocket connect, one-shot GET
//   channel    : shared state machine, delivery gate, backoff, FeedError
//   stream     : StreamChannel (push topics)
//   poll       : PollChannel (daily PnL)
//   store      : StateStore read model
//   supervisor : Supervisor + Dashboard lifecycle
//
pub mod channel;
pub mod config;
pub mod domain;
pub mod metrics;
pub mod normalize;
pub mod poll;
pub mod sse;
pub mod store;
pub mod stream;
pub mod supervisor;
pub mod transport;

pub use channel::{ChannelPolicy, ChannelState, FeedError};
pub use config::{FeedConfig, Routes};
pub use domain::{DailyPnl, InventorySnapshot, Order, OrderBook, Side, Snapshot, TickerSample, Topic};
pub use poll::PollChannel;
pub use store::{Published, StateStore, Subscription};
pub use stream::StreamChannel;
pub use supervisor::{Dashboard, DashboardError, Supervisor};
