// ===============================
// src/store.rs
// ===============================
//
// Read model: latest value per topic.
// - each slot is a watch channel, so a reader always sees a whole value
// - callback observers are invoked after the slot is replaced, outside any
//   lock (an observer may read the store or drop its own subscription)
// - no cross-topic transactions
//
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::domain::{DailyPnl, InventorySnapshot, OrderBook, Snapshot, TickerSample, Topic};
use crate::metrics::{LAST_UPDATE_TS, PUBLISHES};

/// A stored value and when it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub snapshot: Snapshot,
    pub at: DateTime<Utc>,
}

type Observer = Arc<dyn Fn(&Snapshot) + Send + Sync>;

struct Slot {
    value: watch::Sender<Option<Published>>,
    observers: Mutex<Vec<(u64, Observer)>>,
}

impl Slot {
    fn new() -> Self { Self { value: watch::channel(None).0, observers: Mutex::new(Vec::new()) } }
}

struct Inner {
    slots: [Slot; 4],
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

impl Default for StateStore {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("StateStore");
        for t in Topic::ALL {
            d.field(t.name(), &self.current(t));
        }
        d.finish()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner { slots: std::array::from_fn(|_| Slot::new()), next_id: AtomicU64::new(1) }) }
    }

    fn slot(&self, topic: Topic) -> &Slot { &self.inner.slots[topic.index()] }

    /// Replace the value of the snapshot's topic and notify that topic's observers.
    pub fn publish(&self, value: impl Into<Snapshot>) {
        let snapshot = value.into();
        let topic = snapshot.topic();
        let slot = self.slot(topic);
        let at = Utc::now();
        slot.value.send_replace(Some(Published { snapshot: snapshot.clone(), at }));
        PUBLISHES.with_label_values(&[topic.name()]).inc();
        LAST_UPDATE_TS.with_label_values(&[topic.name()]).set(at.timestamp());

        let observers: Vec<Observer> = slot
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in observers {
            observer(&snapshot);
        }
    }

    /// Register for future updates of `topic`; the current value is not replayed.
    /// The observer stays registered until the returned guard is dropped or
    /// `unsubscribe`d.
    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, topic: Topic, observer: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.slot(topic)
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(observer)));
        Subscription { store: Arc::downgrade(&self.inner), topic, id }
    }

    /// Async alternative to `subscribe`: await `changed()` on the receiver.
    pub fn watch(&self, topic: Topic) -> watch::Receiver<Option<Published>> { self.slot(topic).value.subscribe() }

    pub fn current(&self, topic: Topic) -> Option<Snapshot> {
        self.slot(topic).value.borrow().as_ref().map(|p| p.snapshot.clone())
    }

    pub fn updated_at(&self, topic: Topic) -> Option<DateTime<Utc>> {
        self.slot(topic).value.borrow().as_ref().map(|p| p.at)
    }

    pub fn observer_count(&self, topic: Topic) -> usize {
        self.slot(topic).observers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn ticker(&self) -> Option<TickerSample> {
        match self.current(Topic::Ticker) {
            Some(Snapshot::Ticker(t)) => Some(t),
            _ => None,
        }
    }

    pub fn orders(&self) -> Option<OrderBook> {
        match self.current(Topic::Orders) {
            Some(Snapshot::Orders(o)) => Some(o),
            _ => None,
        }
    }

    pub fn inventory(&self) -> Option<InventorySnapshot> {
        match self.current(Topic::Inventory) {
            Some(Snapshot::Inventory(i)) => Some(i),
            _ => None,
        }
    }

    pub fn daily_pnl(&self) -> Option<DailyPnl> {
        match self.current(Topic::DailyPnl) {
            Some(Snapshot::DailyPnl(p)) => Some(p),
            _ => None,
        }
    }
}

/// Observer registration guard.
pub struct Subscription {
    store: Weak<Inner>,
    topic: Topic,
    id: u64,
}

impl Subscription {
    pub fn topic(&self) -> Topic { self.topic }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            inner.slots[self.topic.index()]
                .observers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}
