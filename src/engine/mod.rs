mod error;
mod reconcile;
mod registry;

pub use error::{FetchError, StoreError};
pub use reconcile::{
    AvailabilityTotals, DisplayedSubUnit, ReconciledView, ViewReconciler, displayed_totals, reconcile,
};
pub use registry::{HoldTier, SessionHoldRegistry};

use std::sync::Arc;

use tracing::{info, warn};
use ulid::Ulid;

use crate::config::SyncConfig;
use crate::durable::DurableHoldStore;
use crate::model::{HoldIdent, HoldKey, StayQuery};
use crate::notify::{HoldBus, HoldSignal, HoldSource, SignalKind, Subscription};
use crate::storage::KvStorage;

/// How a hold became confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Paid,
    Book,
}

impl From<Confirmation> for HoldSource {
    fn from(c: Confirmation) -> Self {
        match c {
            Confirmation::Paid => HoldSource::Paid,
            Confirmation::Book => HoldSource::Book,
        }
    }
}

/// The per-session hold service. Built once at session start and handed to
/// every view; there is no global instance.
///
/// The registry is subscribed to the bus first, so by the time any view's
/// handler runs the registry already reflects the signal.
pub struct HoldSync {
    session_id: Ulid,
    registry: Arc<SessionHoldRegistry>,
    bus: HoldBus,
    store: DurableHoldStore,
    _registry_link: Subscription,
}

impl HoldSync {
    pub fn new(storage: Arc<dyn KvStorage>, config: &SyncConfig) -> Self {
        let registry = Arc::new(SessionHoldRegistry::new());
        let bus = HoldBus::new();
        let reg = registry.clone();
        let registry_link = bus.subscribe(move |signal| reg.apply(signal));

        let session_id = Ulid::new();
        info!("hold session {session_id} started");
        Self {
            session_id,
            registry,
            bus,
            store: DurableHoldStore::new(storage, config),
            _registry_link: registry_link,
        }
    }

    pub fn session_id(&self) -> Ulid {
        self.session_id
    }

    pub fn registry(&self) -> &SessionHoldRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &HoldBus {
        &self.bus
    }

    pub fn store(&self) -> &DurableHoldStore {
        &self.store
    }

    fn publish(&self, signal: HoldSignal) -> bool {
        if signal.is_empty() {
            return false;
        }
        self.bus.publish(&signal);
        true
    }

    /// Item added to the cart. Returns false if there was nothing to publish.
    pub fn hold_in_cart(&self, keys: &[HoldKey]) -> bool {
        self.publish(HoldSignal::held(keys, HoldSource::Cart))
    }

    /// Payment or booking went through: promote in memory, then record each
    /// key durably. Storage failures are logged and skipped; returns the
    /// number of records written.
    pub fn confirm(&self, query: &StayQuery, keys: &[HoldKey], via: Confirmation) -> usize {
        if !self.publish(HoldSignal::held(keys, via.into())) {
            return 0;
        }
        let mut written = 0;
        for key in keys {
            match self.store.record_confirmed_hold(query, key) {
                Ok(()) => written += 1,
                Err(e) => {
                    metrics::counter!(crate::observability::STORE_ERRORS_TOTAL, "op" => "record")
                        .increment(1);
                    warn!("could not persist confirmed hold {key} for {query}: {e}");
                }
            }
        }
        written
    }

    pub fn cancel(&self, keys: &[HoldKey]) -> bool {
        self.publish(HoldSignal::released(keys))
    }

    /// Release every cart-tier hold, for flows that empty the cart without
    /// going through per-item removal. Returns the number of identifiers released.
    pub fn clear_cart(&self) -> usize {
        let idents = self.registry.cart_idents();
        let count = idents.len();
        let mut signal = HoldSignal {
            kind: SignalKind::Released,
            inventory_ids: Vec::new(),
            numbers: Vec::new(),
            source: HoldSource::Cancel,
        };
        for ident in idents {
            match ident {
                HoldIdent::Inventory(id) => signal.inventory_ids.push(id),
                HoldIdent::Number(no) => signal.numbers.push(no),
            }
        }
        self.publish(signal);
        count
    }

    /// Seed the registry with durable holds for exactly this query. The keys go
    /// out as a confirmed (`book`) signal, so views mounted earlier see them too.
    /// Returns how many keys were restored; storage failures yield 0.
    pub fn rehydrate(&self, query: &StayQuery) -> usize {
        let keys = match self.store.reconstruct_holds(query) {
            Ok(keys) => keys,
            Err(e) => {
                metrics::counter!(crate::observability::STORE_ERRORS_TOTAL, "op" => "reconstruct")
                    .increment(1);
                warn!("could not reconstruct holds for {query}: {e}");
                return 0;
            }
        };
        if self.publish(HoldSignal::held(&keys, HoldSource::Book)) {
            metrics::counter!(crate::observability::HOLDS_REHYDRATED_TOTAL).increment(keys.len() as u64);
            info!("rehydrated {} confirmed holds for {query}", keys.len());
        }
        keys.len()
    }
}
