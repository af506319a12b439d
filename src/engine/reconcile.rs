use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::model::{AvailabilitySnapshot, StayQuery, SubUnit, SubUnitStatus};
use crate::notify::Subscription;

use super::HoldSync;
use super::registry::SessionHoldRegistry;

/// Server aggregate counts, passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityTotals {
    pub total_units: u32,
    pub available_units: u32,
    pub occupied_units: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayedSubUnit {
    pub inventory_id: Option<String>,
    pub number: Option<String>,
    pub status: SubUnitStatus,
    pub is_available: bool,
    pub check_in: Option<String>,
    pub check_out: Option<String>,
    /// Held somewhere in this session.
    pub locally_held: bool,
    /// Held in the cart (not yet paid or booked).
    pub cart_badge: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledView {
    pub totals: AvailabilityTotals,
    pub sub_units: Vec<DisplayedSubUnit>,
}

impl ReconciledView {
    pub fn sub_unit(&self, inventory_id: &str) -> Option<&DisplayedSubUnit> {
        self.sub_units
            .iter()
            .find(|s| s.inventory_id.as_deref() == Some(inventory_id))
    }
}

pub fn displayed_totals(snapshot: &AvailabilitySnapshot) -> AvailabilityTotals {
    AvailabilityTotals {
        total_units: snapshot.total_units,
        available_units: snapshot.available_units,
        occupied_units: snapshot.occupied_units,
    }
}

fn display_sub_unit(sub: &SubUnit, registry: &SessionHoldRegistry) -> DisplayedSubUnit {
    // No identifier: cannot match a hold, shown as the server reports it.
    let (held, cart) = match sub.key() {
        Some(key) => (registry.is_held(&key), registry.is_cart_held(&key)),
        None => (false, false),
    };
    DisplayedSubUnit {
        inventory_id: sub.inventory_id.clone(),
        number: sub.number.clone(),
        status: if held { SubUnitStatus::Occupied } else { sub.status },
        is_available: if held { false } else { sub.is_available },
        check_in: sub.check_in.clone(),
        check_out: sub.check_out.clone(),
        locally_held: held,
        cart_badge: cart,
    }
}

/// Merge a snapshot with local holds. Recomputed from scratch on every call,
/// so snapshot and signal arrival order does not matter.
///
/// A local hold always wins over the server's per-sub-unit status; the
/// aggregate counts are never touched.
pub fn reconcile(snapshot: &AvailabilitySnapshot, registry: &SessionHoldRegistry) -> ReconciledView {
    ReconciledView {
        totals: displayed_totals(snapshot),
        sub_units: snapshot
            .sub_units
            .iter()
            .map(|s| display_sub_unit(s, registry))
            .collect(),
    }
}

/// Reconciliation state owned by one mounted view (inventory table, booking
/// flow, cart). Rehydrates durable holds once on mount and counts signals so
/// the host knows when to render again.
pub struct ViewReconciler {
    name: String,
    sync: Arc<HoldSync>,
    query: StayQuery,
    revision: Arc<AtomicU64>,
    _subscription: Subscription,
}

impl ViewReconciler {
    pub fn mount(name: impl Into<String>, sync: Arc<HoldSync>, query: StayQuery) -> Self {
        let name = name.into();
        let rehydrated = sync.rehydrate(&query);
        tracing::debug!("view {name} mounted for {query}, {rehydrated} holds rehydrated");

        let revision = Arc::new(AtomicU64::new(0));
        let rev = revision.clone();
        let subscription = sync.bus().subscribe(move |_| {
            rev.fetch_add(1, Ordering::SeqCst);
        });

        Self {
            name,
            sync,
            query,
            revision,
            _subscription: subscription,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn query(&self) -> &StayQuery {
        &self.query
    }

    /// Number of hold signals seen since mount.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn render(&self, snapshot: &AvailabilitySnapshot) -> ReconciledView {
        reconcile(snapshot, self.sync.registry())
    }
}
