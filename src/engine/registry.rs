use dashmap::DashMap;

use crate::model::{HoldIdent, HoldKey};
use crate::notify::{HoldSignal, HoldSource, SignalKind};

/// How far along a hold is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldTier {
    /// In the cart; reversible by cancel.
    Cart,
    /// Paid or booked.
    Confirmed,
}

/// In-memory holds for the current session.
///
/// Conceptually two sets, `allHolds` and `cartHolds ⊆ allHolds`; stored as
/// one map from identifier to tier so the subset relation cannot break.
/// All operations are idempotent set algebra.
#[derive(Default)]
pub struct SessionHoldRegistry {
    holds: DashMap<HoldIdent, HoldTier>,
}

impl SessionHoldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hold(&self, key: &HoldKey, tier: HoldTier) {
        self.add_idents(key.idents(), tier);
    }

    pub fn promote_hold(&self, key: &HoldKey) {
        self.promote_idents(key.idents());
    }

    pub fn release_hold(&self, key: &HoldKey) {
        self.release_idents(key.idents());
    }

    pub fn is_held(&self, key: &HoldKey) -> bool {
        key.idents().any(|i| self.holds.contains_key(&i))
    }

    pub fn is_cart_held(&self, key: &HoldKey) -> bool {
        key.idents()
            .any(|i| self.holds.get(&i).is_some_and(|t| *t == HoldTier::Cart))
    }

    pub fn held_count(&self) -> usize {
        self.holds.len()
    }

    pub fn cart_count(&self) -> usize {
        self.holds.iter().filter(|e| *e.value() == HoldTier::Cart).count()
    }

    /// Cart-tier identifiers, sorted.
    pub fn cart_idents(&self) -> Vec<HoldIdent> {
        let mut idents: Vec<HoldIdent> = self
            .holds
            .iter()
            .filter(|e| *e.value() == HoldTier::Cart)
            .map(|e| e.key().clone())
            .collect();
        idents.sort();
        idents
    }

    /// Apply a bus signal: `Released` or a cancel releases, a cart hold adds
    /// to the cart tier, a payment or booking promotes.
    pub fn apply(&self, signal: &HoldSignal) {
        let idents = signal.idents();
        match (signal.kind, signal.source) {
            (SignalKind::Released, _) | (SignalKind::Held, HoldSource::Cancel) => {
                self.release_idents(idents)
            }
            (SignalKind::Held, HoldSource::Cart) => self.add_idents(idents, HoldTier::Cart),
            (SignalKind::Held, HoldSource::Paid | HoldSource::Book) => self.promote_idents(idents),
        }
        metrics::gauge!(crate::observability::HOLDS_ACTIVE).set(self.holds.len() as f64);
    }

    fn add_idents(&self, idents: impl IntoIterator<Item = HoldIdent>, tier: HoldTier) {
        for ident in idents {
            match tier {
                HoldTier::Cart => {
                    self.holds.insert(ident, HoldTier::Cart);
                }
                HoldTier::Confirmed => {
                    self.holds.entry(ident).or_insert(HoldTier::Confirmed);
                }
            }
        }
    }

    fn promote_idents(&self, idents: impl IntoIterator<Item = HoldIdent>) {
        for ident in idents {
            self.holds.insert(ident, HoldTier::Confirmed);
        }
    }

    fn release_idents(&self, idents: impl IntoIterator<Item = HoldIdent>) {
        for ident in idents {
            self.holds.remove(&ident);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> HoldKey {
        HoldKey::from_inventory_id(id).unwrap()
    }

    #[test]
    fn add_is_idempotent() {
        let r = SessionHoldRegistry::new();
        r.add_hold(&key("482"), HoldTier::Cart);
        let (held, cart) = (r.held_count(), r.cart_count());
        r.add_hold(&key("482"), HoldTier::Cart);
        assert_eq!((r.held_count(), r.cart_count()), (held, cart));
        assert_eq!((held, cart), (1, 1));
    }

    #[test]
    fn confirmed_tier_only_enters_all_holds() {
        let r = SessionHoldRegistry::new();
        r.add_hold(&key("1"), HoldTier::Confirmed);
        assert!(r.is_held(&key("1")));
        assert!(!r.is_cart_held(&key("1")));
    }

    #[test]
    fn confirmed_add_does_not_clear_cart_tier() {
        let r = SessionHoldRegistry::new();
        r.add_hold(&key("1"), HoldTier::Cart);
        r.add_hold(&key("1"), HoldTier::Confirmed);
        assert!(r.is_cart_held(&key("1")));
    }

    #[test]
    fn promote_keeps_hold_and_drops_badge() {
        let r = SessionHoldRegistry::new();
        r.add_hold(&key("482"), HoldTier::Cart);
        r.promote_hold(&key("482"));
        assert!(r.is_held(&key("482")));
        assert!(!r.is_cart_held(&key("482")));
    }

    #[test]
    fn release_rolls_back_to_never_held() {
        let r = SessionHoldRegistry::new();
        r.add_hold(&key("482"), HoldTier::Cart);
        r.release_hold(&key("482"));
        assert!(!r.is_held(&key("482")));
        assert!(!r.is_cart_held(&key("482")));
        assert_eq!(r.held_count(), 0);
    }

    #[test]
    fn lookup_by_either_identifier() {
        let r = SessionHoldRegistry::new();
        r.add_hold(&HoldKey::new(Some("482"), Some("12")).unwrap(), HoldTier::Cart);
        assert!(r.is_held(&HoldKey::from_number("12").unwrap()));
        assert!(r.is_cart_held(&key("482")));
        // namespaces don't bleed
        assert!(!r.is_held(&key("12")));
    }

    #[test]
    fn partial_release_leaves_other_identifier_held() {
        // A release that names only the number leaves the inventory id held;
        // callers must release with the same identifiers they added.
        let r = SessionHoldRegistry::new();
        r.add_hold(&HoldKey::new(Some("482"), Some("12")).unwrap(), HoldTier::Cart);
        r.release_hold(&HoldKey::from_number("12").unwrap());
        assert!(r.is_held(&key("482")));
        assert!(r.is_cart_held(&key("482")));
    }

    #[test]
    fn apply_routes_by_source() {
        let r = SessionHoldRegistry::new();
        let k = [key("482")];

        r.apply(&HoldSignal::held(&k, HoldSource::Cart));
        assert!(r.is_cart_held(&k[0]));

        r.apply(&HoldSignal::held(&k, HoldSource::Paid));
        assert!(r.is_held(&k[0]) && !r.is_cart_held(&k[0]));

        r.apply(&HoldSignal::released(&k));
        assert!(!r.is_held(&k[0]));

        r.apply(&HoldSignal::held(&k, HoldSource::Book));
        assert!(r.is_held(&k[0]));

        r.apply(&HoldSignal::held(&k, HoldSource::Cancel));
        assert!(!r.is_held(&k[0]));
    }

    #[test]
    fn cart_idents_lists_only_cart_tier() {
        let r = SessionHoldRegistry::new();
        r.add_hold(&key("2"), HoldTier::Cart);
        r.add_hold(&key("1"), HoldTier::Cart);
        r.add_hold(&key("3"), HoldTier::Confirmed);
        assert_eq!(
            r.cart_idents(),
            vec![HoldIdent::Inventory("1".into()), HoldIdent::Inventory("2".into())]
        );
    }
}
