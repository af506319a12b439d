use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{HoldIdent, HoldKey, de_ident_list, normalize_ident};

const CHANNEL_CAPACITY: usize = 256;

/// Which flow emitted a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoldSource {
    Cart,
    Paid,
    Book,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Held,
    Released,
}

/// Payload carried on the bus. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldSignal {
    pub kind: SignalKind,
    #[serde(default, deserialize_with = "de_ident_list")]
    pub inventory_ids: Vec<String>,
    #[serde(default, deserialize_with = "de_ident_list")]
    pub numbers: Vec<String>,
    pub source: HoldSource,
}

impl HoldSignal {
    pub fn held(keys: &[HoldKey], source: HoldSource) -> Self {
        Self::from_keys(SignalKind::Held, keys, source)
    }

    pub fn released(keys: &[HoldKey]) -> Self {
        Self::from_keys(SignalKind::Released, keys, HoldSource::Cancel)
    }

    fn from_keys(kind: SignalKind, keys: &[HoldKey], source: HoldSource) -> Self {
        Self {
            kind,
            inventory_ids: keys.iter().filter_map(|k| k.inventory_id().map(str::to_string)).collect(),
            numbers: keys.iter().filter_map(|k| k.number().map(str::to_string)).collect(),
            source,
        }
    }

    /// Normalized identifiers named by this signal. Blank entries are dropped.
    pub fn idents(&self) -> Vec<HoldIdent> {
        let ids = self
            .inventory_ids
            .iter()
            .filter_map(|s| normalize_ident(s))
            .map(HoldIdent::Inventory);
        let numbers = self
            .numbers
            .iter()
            .filter_map(|s| normalize_ident(s))
            .map(HoldIdent::Number);
        ids.chain(numbers).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.idents().is_empty()
    }
}

pub type Handler = Arc<dyn Fn(&HoldSignal) + Send + Sync>;

struct BusInner {
    /// Keyed by a monotonically increasing id, so key order is registration order.
    handlers: DashMap<u64, Handler>,
    next_id: AtomicU64,
    sender: broadcast::Sender<HoldSignal>,
}

/// Same-process publish/subscribe hub for hold signals.
///
/// Delivery is synchronous, in registration order, and finishes before
/// `publish` returns. There is no replay for late subscribers.
#[derive(Clone)]
pub struct HoldBus {
    inner: Arc<BusInner>,
}

impl Default for HoldBus {
    fn default() -> Self {
        Self::new()
    }
}

impl HoldBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: DashMap::new(),
                next_id: AtomicU64::new(0),
                sender: broadcast::channel(CHANNEL_CAPACITY).0,
            }),
        }
    }

    /// Register a handler. It stays registered until the returned guard is dropped.
    #[must_use = "dropping the Subscription unsubscribes the handler"]
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&HoldSignal) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.insert(id, Arc::new(handler));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Async receiver fed after the synchronous handlers of each publish.
    pub fn listen(&self) -> broadcast::Receiver<HoldSignal> {
        self.inner.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.len()
    }

    /// Deliver to every current handler. A panicking handler is logged and
    /// skipped; the rest still receive the signal. Returns the number of
    /// handlers that completed.
    pub fn publish(&self, signal: &HoldSignal) -> usize {
        metrics::counter!(
            crate::observability::SIGNALS_PUBLISHED_TOTAL,
            "source" => crate::observability::source_label(signal.source)
        )
        .increment(1);
        tracing::debug!(
            kind = ?signal.kind,
            source = ?signal.source,
            inventory_ids = ?signal.inventory_ids,
            numbers = ?signal.numbers,
            "publishing hold signal"
        );

        // Snapshot first so handlers may (un)subscribe without touching the map we iterate.
        let mut handlers: Vec<(u64, Handler)> = self
            .inner
            .handlers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handlers.sort_by_key(|(id, _)| *id);

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(signal))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    metrics::counter!(crate::observability::HANDLER_PANICS_TOTAL).increment(1);
                    tracing::error!("hold signal handler {id} panicked; continuing delivery");
                }
            }
        }

        // No-op if nobody is listening.
        let _ = self.inner.sender.send(signal.clone());
        delivered
    }
}

/// Registration guard returned by [`HoldBus::subscribe`].
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.handlers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn key(id: &str) -> HoldKey {
        HoldKey::from_inventory_id(id).unwrap()
    }

    #[test]
    fn delivers_in_registration_order() {
        let bus = HoldBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let subs: Vec<Subscription> = (0..3)
            .map(|i| {
                let seen = seen.clone();
                bus.subscribe(move |_| seen.lock().unwrap().push(i))
            })
            .collect();

        let delivered = bus.publish(&HoldSignal::held(&[key("1")], HoldSource::Cart));
        assert_eq!(delivered, 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        drop(subs);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let bus = HoldBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        let h1 = hits.clone();
        let _a = bus.subscribe(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let _b = bus.subscribe(|_| panic!("view blew up"));
        let h3 = hits.clone();
        let _c = bus.subscribe(move |_| {
            h3.fetch_add(1, Ordering::SeqCst);
        });

        let delivered = bus.publish(&HoldSignal::released(&[key("1")]));
        assert_eq!(delivered, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = HoldBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        let sub = bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(&HoldSignal::held(&[key("1")], HoldSource::Cart));
        sub.unsubscribe();
        bus.publish(&HoldSignal::held(&[key("1")], HoldSource::Cart));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn late_subscriber_sees_no_replay() {
        let bus = HoldBus::new();
        bus.publish(&HoldSignal::held(&[key("1")], HoldSource::Cart));

        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        let _sub = bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_subscribing_during_publish_joins_next_round() {
        let bus = HoldBus::new();
        let inner_hits = Arc::new(AtomicU64::new(0));
        let late: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

        let bus2 = bus.clone();
        let late2 = late.clone();
        let ih = inner_hits.clone();
        let _outer = bus.subscribe(move |_| {
            let ih = ih.clone();
            let sub = bus2.subscribe(move |_| {
                ih.fetch_add(1, Ordering::SeqCst);
            });
            late2.lock().unwrap().push(sub);
        });

        bus.publish(&HoldSignal::held(&[key("1")], HoldSource::Cart));
        assert_eq!(inner_hits.load(Ordering::SeqCst), 0);
        bus.publish(&HoldSignal::held(&[key("1")], HoldSource::Cart));
        assert_eq!(inner_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listen_receives_after_handlers() {
        let bus = HoldBus::new();
        let mut rx = bus.listen();
        let signal = HoldSignal::held(&[key("482")], HoldSource::Paid);
        bus.publish(&signal);
        let received = rx.recv().await.unwrap();
        assert_eq!(received, signal);
    }

    #[test]
    fn signal_payload_shape() {
        let k = HoldKey::new(Some("482"), Some("12")).unwrap();
        let signal = HoldSignal::held(&[k], HoldSource::Book);
        let v = serde_json::to_value(&signal).unwrap();
        assert_eq!(v["kind"], "held");
        assert_eq!(v["source"], "book");
        assert_eq!(v["inventoryIds"][0], "482");
        assert_eq!(v["numbers"][0], "12");

        let blank = HoldSignal {
            kind: SignalKind::Held,
            inventory_ids: vec![" ".into()],
            numbers: vec![],
            source: HoldSource::Cart,
        };
        assert!(blank.is_empty());
    }
}
