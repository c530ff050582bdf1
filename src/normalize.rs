// ===============================
// src/normalize.rs
// ===============================
//
// Wire payload -> typed record.
// - numeric fields accept JSON numbers or numeric strings
// - every number must be finite ("NaN"/"inf" parse fine in Rust, so check)
// - order batches: non-array fails the batch, bad element is dropped alone
//
// Everything here is pure; callers decide how to log `dropped`.
//
use ahash::AHashMap as HashMap;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::{DailyPnl, InventorySnapshot, Order, OrderBook, Side, Snapshot, TickerSample, Topic};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload is not a JSON array")]
    NotAnArray,
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("field `{field}` is not numeric: {value}")]
    NotNumeric { field: &'static str, value: String },
    #[error("field `{0}` is not finite")]
    NotFinite(&'static str),
    #[error("field `{0}` is not an integer")]
    NotInteger(&'static str),
    #[error("field `{0}` must be a non-empty string")]
    NotALabel(&'static str),
    #[error("unknown order side `{0}`")]
    BadSide(String),
}

/// Result of normalizing one message. `dropped` holds element-level
/// rejections for batch payloads (index into the wire array).
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub value: T,
    pub dropped: Vec<(usize, ValidationError)>,
}

impl<T> Normalized<T> {
    fn whole(value: T) -> Self { Self { value, dropped: Vec::new() } }
}

/// A record shape that can be built from a decoded wire payload.
pub trait Normalize: Sized + Into<Snapshot> + Send + 'static {
    const TOPIC: Topic;
    fn normalize(raw: &Value) -> Result<Normalized<Self>, ValidationError>;
}

fn object(raw: &Value) -> Result<&Map<String, Value>, ValidationError> {
    raw.as_object().ok_or(ValidationError::NotAnObject)
}

fn field<'a>(obj: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, ValidationError> {
    match obj.get(name) {
        Some(Value::Null) | None => Err(ValidationError::Missing(name)),
        Some(v) => Ok(v),
    }
}

fn not_numeric(name: &'static str, v: &Value) -> ValidationError {
    ValidationError::NotNumeric { field: name, value: v.to_string() }
}

/// String-or-number -> finite f64.
pub fn number(obj: &Map<String, Value>, name: &'static str) -> Result<f64, ValidationError> {
    let v = field(obj, name)?;
    let n = match v {
        Value::Number(n) => n.as_f64().ok_or_else(|| not_numeric(name, v))?,
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| not_numeric(name, v))?,
        _ => return Err(not_numeric(name, v)),
    };
    if n.is_finite() { Ok(n) } else { Err(ValidationError::NotFinite(name)) }
}

/// String-or-number -> i64. Float forms are accepted only when integral.
pub fn integer(obj: &Map<String, Value>, name: &'static str) -> Result<i64, ValidationError> {
    let v = field(obj, name)?;
    let from_float = |f: f64| -> Result<i64, ValidationError> {
        if !f.is_finite() {
            return Err(ValidationError::NotFinite(name));
        }
        if f.fract() != 0.0 || f < i64::MIN as f64 || f >= i64::MAX as f64 {
            return Err(ValidationError::NotInteger(name));
        }
        Ok(f as i64)
    };
    match v {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(i),
            None => from_float(n.as_f64().ok_or_else(|| not_numeric(name, v))?),
        },
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Ok(i);
            }
            from_float(s.parse::<f64>().map_err(|_| not_numeric(name, v))?)
        }
        _ => Err(not_numeric(name, v)),
    }
}

fn label(obj: &Map<String, Value>, name: &'static str) -> Result<String, ValidationError> {
    match field(obj, name)? {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(ValidationError::NotALabel(name)),
    }
}

pub fn parse_side(raw: &str) -> Result<Side, ValidationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "buy" | "b" | "bid" => Ok(Side::Buy),
        "sell" | "s" | "ask" | "a" => Ok(Side::Sell),
        _ => Err(ValidationError::BadSide(raw.to_string())),
    }
}

pub fn ticker(raw: &Value) -> Result<TickerSample, ValidationError> {
    let o = object(raw)?;
    Ok(TickerSample {
        mid: number(o, "mid")?,
        bid: number(o, "bid")?,
        ask: number(o, "ask")?,
        ts: integer(o, "ts")?,
    })
}

pub fn order(raw: &Value) -> Result<Order, ValidationError> {
    let o = object(raw)?;
    let side = match field(o, "side")? {
        Value::String(s) => parse_side(s)?,
        other => return Err(ValidationError::BadSide(other.to_string())),
    };
    Ok(Order { oid: label(o, "oid")?, side, px: number(o, "px")?, qty: number(o, "qty")? })
}

/// Batch policy: one bad element never costs the rest of the book.
/// Repeated `oid`: the later element wins, keeping the first position.
pub fn orders(raw: &Value) -> Result<Normalized<OrderBook>, ValidationError> {
    let items = raw.as_array().ok_or(ValidationError::NotAnArray)?;
    let mut out: Vec<Order> = Vec::with_capacity(items.len());
    let mut by_oid: HashMap<String, usize> = HashMap::with_capacity(items.len());
    let mut dropped = Vec::new();
    for (i, item) in items.iter().enumerate() {
        match order(item) {
            Ok(ord) => match by_oid.get(&ord.oid) {
                Some(&slot) => out[slot] = ord,
                None => {
                    by_oid.insert(ord.oid.clone(), out.len());
                    out.push(ord);
                }
            },
            Err(e) => dropped.push((i, e)),
        }
    }
    Ok(Normalized { value: OrderBook { orders: out }, dropped })
}

pub fn inventory(raw: &Value) -> Result<InventorySnapshot, ValidationError> {
    let o = object(raw)?;
    Ok(InventorySnapshot {
        equity: number(o, "equity")?,
        cash: number(o, "cash")?,
        inventory: number(o, "inventory")?,
    })
}

pub fn daily_pnl(raw: &Value) -> Result<DailyPnl, ValidationError> {
    let o = object(raw)?;
    Ok(DailyPnl {
        day: label(o, "day")?,
        realised: number(o, "realised")?,
        unrealised: number(o, "unrealised")?,
        equity: number(o, "equity")?,
    })
}

impl Normalize for TickerSample {
    const TOPIC: Topic = Topic::Ticker;
    fn normalize(raw: &Value) -> Result<Normalized<Self>, ValidationError> { ticker(raw).map(Normalized::whole) }
}

impl Normalize for OrderBook {
    const TOPIC: Topic = Topic::Orders;
    fn normalize(raw: &Value) -> Result<Normalized<Self>, ValidationError> { orders(raw) }
}

impl Normalize for InventorySnapshot {
    const TOPIC: Topic = Topic::Inventory;
    fn normalize(raw: &Value) -> Result<Normalized<Self>, ValidationError> { inventory(raw).map(Normalized::whole) }
}

impl Normalize for DailyPnl {
    const TOPIC: Topic = Topic::DailyPnl;
    fn normalize(raw: &Value) -> Result<Normalized<Self>, ValidationError> { daily_pnl(raw).map(Normalized::whole) }
}
