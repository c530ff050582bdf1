// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }

impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickerSample { pub mid: f64, pub bid: f64, pub ask: f64, pub ts: i64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order { pub oid: String, pub side: Side, pub px: f64, pub qty: f64 }

/// Active orders as of the latest message. Always a full replacement set,
/// never merged with the previous one; `oid`s are unique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook { pub orders: Vec<Order> }

impl OrderBook {
    pub fn len(&self) -> usize { self.orders.len() }
    pub fn is_empty(&self) -> bool { self.orders.is_empty() }
    pub fn get(&self, oid: &str) -> Option<&Order> { self.orders.iter().find(|o| o.oid == oid) }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot { pub equity: f64, pub cash: f64, pub inventory: f64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPnl { pub day: String, pub realised: f64, pub unrealised: f64, pub equity: f64 }

/// One named logical data feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic { Ticker, Orders, Inventory, DailyPnl }

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::Ticker, Topic::Orders, Topic::Inventory, Topic::DailyPnl];

    /// Stable name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Topic::Ticker => "ticker",
            Topic::Orders => "orders",
            Topic::Inventory => "inventory",
            Topic::DailyPnl => "daily-pnl",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self { Topic::Ticker => 0, Topic::Orders => 1, Topic::Inventory => 2, Topic::DailyPnl => 3 }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

/// Complete current value of one topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Snapshot {
    Ticker(TickerSample),
    Orders(OrderBook),
    Inventory(InventorySnapshot),
    DailyPnl(DailyPnl),
}

impl Snapshot {
    pub fn topic(&self) -> Topic {
        match self {
            Snapshot::Ticker(_) => Topic::Ticker,
            Snapshot::Orders(_) => Topic::Orders,
            Snapshot::Inventory(_) => Topic::Inventory,
            Snapshot::DailyPnl(_) => Topic::DailyPnl,
        }
    }
}

impl From<TickerSample> for Snapshot { fn from(v: TickerSample) -> Self { Snapshot::Ticker(v) } }
impl From<OrderBook> for Snapshot { fn from(v: OrderBook) -> Self { Snapshot::Orders(v) } }
impl From<InventorySnapshot> for Snapshot { fn from(v: InventorySnapshot) -> Self { Snapshot::Inventory(v) } }
impl From<DailyPnl> for Snapshot { fn from(v: DailyPnl) -> Self { Snapshot::DailyPnl(v) } }
