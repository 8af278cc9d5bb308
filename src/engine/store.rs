use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedPropertyState = Arc<RwLock<PropertyState>>;

enum Claim {
    InFlight,
    Committed(Ulid),
}

pub(crate) enum ClaimOutcome<'a> {
    /// Key was free and is now reserved for the caller.
    Claimed(ClaimGuard<'a>),
    /// A booking already exists for this key.
    Committed(Ulid),
    InFlight,
}

/// Reservation of a correlation key. Dropping it without the booking having been
/// applied frees the key again.
pub(crate) struct ClaimGuard<'a> {
    claims: &'a DashMap<String, Claim>,
    key: String,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.claims
            .remove_if(&self.key, |_, claim| matches!(claim, Claim::InFlight));
    }
}

/// Everything the engine keeps in memory, indexed for the lookups the write and
/// read paths need.
#[derive(Default)]
pub struct InMemoryStore {
    properties: DashMap<Ulid, SharedPropertyState>,
    /// room / add-on / booking / feed id → owning property id
    owner: DashMap<Ulid, Ulid>,
    rules: DashMap<Ulid, PricingRule>,
    claims: DashMap<String, Claim>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Properties ───────────────────────────────────────────

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn contains_property(&self, id: &Ulid) -> bool {
        self.properties.contains_key(id)
    }

    pub fn get_property(&self, id: &Ulid) -> Option<SharedPropertyState> {
        self.properties.get(id).map(|e| e.value().clone())
    }

    pub fn insert_property(&self, id: Ulid, state: SharedPropertyState) {
        self.properties.insert(id, state);
    }

    pub fn property_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.properties.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Entity index ─────────────────────────────────────────

    pub fn owner_of(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.owner.get(entity_id).map(|e| *e.value())
    }

    pub fn is_known_entity(&self, entity_id: &Ulid) -> bool {
        self.owner.contains_key(entity_id) || self.properties.contains_key(entity_id)
    }

    pub fn map_entity(&self, entity_id: Ulid, property_id: Ulid) {
        self.owner.insert(entity_id, property_id);
    }

    pub fn unmap_entity(&self, entity_id: &Ulid) {
        self.owner.remove(entity_id);
    }

    // ── Pricing rules ────────────────────────────────────────

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn get_rule(&self, id: &Ulid) -> Option<PricingRule> {
        self.rules.get(id).map(|r| r.value().clone())
    }

    pub fn put_rule(&self, rule: PricingRule) {
        self.rules.insert(rule.id, rule);
    }

    pub fn remove_rule(&self, id: &Ulid) -> Option<PricingRule> {
        self.rules.remove(id).map(|(_, r)| r)
    }

    /// Rules that could apply to `property_id` (its own plus global ones), ordered by id.
    pub fn rules_for(&self, property_id: &Ulid) -> Vec<PricingRule> {
        let mut rules: Vec<PricingRule> = self
            .rules
            .iter()
            .filter(|r| r.property_id.is_none_or(|p| p == *property_id))
            .map(|r| r.value().clone())
            .collect();
        rules.sort_by_key(|r| r.id);
        rules
    }

    pub fn all_rules(&self) -> Vec<PricingRule> {
        let mut rules: Vec<PricingRule> = self.rules.iter().map(|r| r.value().clone()).collect();
        rules.sort_by_key(|r| r.id);
        rules
    }

    // ── Correlation keys ─────────────────────────────────────

    /// Atomically reserve `key` unless it is already taken.
    pub(crate) fn claim(&self, key: &str) -> ClaimOutcome<'_> {
        match self.claims.entry(key.to_string()) {
            Entry::Occupied(e) => match e.get() {
                Claim::Committed(id) => ClaimOutcome::Committed(*id),
                Claim::InFlight => ClaimOutcome::InFlight,
            },
            Entry::Vacant(v) => {
                v.insert(Claim::InFlight);
                ClaimOutcome::Claimed(ClaimGuard {
                    claims: &self.claims,
                    key: key.to_string(),
                })
            }
        }
    }

    /// Record that `key` now belongs to `booking_id`. Called when the booking is applied.
    pub fn commit_key(&self, key: &str, booking_id: Ulid) {
        self.claims
            .insert(key.to_string(), Claim::Committed(booking_id));
    }

    pub fn booking_for_key(&self, key: &str) -> Option<Ulid> {
        self.claims.get(key).and_then(|c| match c.value() {
            Claim::Committed(id) => Some(*id),
            Claim::InFlight => None,
        })
    }
}
