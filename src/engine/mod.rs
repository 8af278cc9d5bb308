mod availability;
mod error;
mod mutations;
mod pricing;
mod queries;
mod store;

pub use availability::{Conflict, RoomAvailability, find_conflict, resolve_rooms, room_availability};
pub use error::EngineError;
pub use mutations::{BlockInsert, BookingRequest, BookingWrite, WriteOrigin};
pub use pricing::{
    AddOnLine, Adjustment, PricingTarget, Quote, RuleMatch, adjustments, applicable_rules,
    calculate_price, round_money,
};
pub use queries::{Availability, RoomCalendar};
pub use store::{InMemoryStore, SharedPropertyState};

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::journal::{Journal, MemoryJournal, WalJournal};
use crate::model::*;

/// The booking engine: per-property state behind its own lock, a global rule
/// table, and the journal every change goes through first.
pub struct Engine {
    pub(crate) store: InMemoryStore,
    journal: Arc<dyn Journal>,
    /// Writers hold this shared; compaction holds it exclusively so the snapshot
    /// and the journal swap see no interleaved appends. Always taken before any
    /// property lock.
    write_gate: RwLock<()>,
}

/// A property write lock plus the write gate that must outlive it.
pub(crate) struct PropertyWrite<'a> {
    _gate: RwLockReadGuard<'a, ()>,
    pub state: OwnedRwLockWriteGuard<PropertyState>,
}

/// Apply an event to a property's state. Caller holds the write lock (or owns
/// the state outright during replay).
fn apply_to_property(ps: &mut PropertyState, event: &Event, store: &InMemoryStore) {
    match event {
        Event::PropertyCreated { property } | Event::PropertyUpdated { property } => {
            ps.property = property.clone();
        }
        Event::RoomCreated { room } => {
            store.map_entity(room.id, room.property_id);
            ps.rooms.push(room.clone());
        }
        Event::RoomUpdated { room } => {
            if let Some(existing) = ps.rooms.iter_mut().find(|r| r.id == room.id) {
                *existing = room.clone();
            }
        }
        Event::AddOnCreated { add_on } => {
            store.map_entity(add_on.id, add_on.property_id);
            ps.add_ons.push(add_on.clone());
        }
        Event::AddOnUpdated { add_on } => {
            if let Some(existing) = ps.add_ons.iter_mut().find(|a| a.id == add_on.id) {
                *existing = add_on.clone();
            }
        }
        Event::FeedAdded { feed } => {
            store.map_entity(feed.id, feed.property_id);
            ps.feeds.push(feed.clone());
        }
        Event::FeedRemoved { id, .. } => {
            ps.feeds.retain(|f| f.id != *id);
            store.unmap_entity(id);
        }
        Event::BookingCreated { booking } => {
            store.map_entity(booking.id, booking.property_id);
            if let Some(key) = &booking.correlation_key {
                store.commit_key(key, booking.id);
            }
            ps.insert_booking(booking.clone());
        }
        Event::BookingUpdated {
            id,
            status,
            payment_status,
            updated_at,
            ..
        } => {
            if let Some(b) = ps.booking_mut(id) {
                b.status = *status;
                b.payment_status = *payment_status;
                b.updated_at = *updated_at;
            }
        }
        Event::BlockRemoved { id, .. } => {
            ps.remove_booking(id);
            store.unmap_entity(id);
        }
        // global, handled by apply_global
        Event::RuleAdded { .. } | Event::RuleUpdated { .. } | Event::RuleRemoved { .. } => {}
    }
}

fn apply_global(store: &InMemoryStore, event: &Event) {
    match event {
        Event::RuleAdded { rule } | Event::RuleUpdated { rule } => store.put_rule(rule.clone()),
        Event::RuleRemoved { id } => {
            store.remove_rule(id);
        }
        _ => {}
    }
}

impl Engine {
    /// Open (or create) the journal at `path` and rebuild state from it.
    pub fn new(path: &Path) -> io::Result<Self> {
        let (journal, history) = WalJournal::open(path)?;
        let engine = Self::with_journal(Arc::new(journal), history);
        tracing::info!(
            path = %path.display(),
            properties = engine.store.property_count(),
            rules = engine.store.rule_count(),
            "engine state recovered"
        );
        Ok(engine)
    }

    /// Engine whose journal lives only in memory.
    pub fn in_memory() -> Self {
        Self::with_journal(Arc::new(MemoryJournal::new()), Vec::new())
    }

    /// Build an engine over `journal`, replaying `history` in order.
    pub fn with_journal(journal: Arc<dyn Journal>, history: Vec<Event>) -> Self {
        let store = InMemoryStore::new();
        // Replay into plain owned states first; they are wrapped in locks at the end.
        let mut states: HashMap<Ulid, PropertyState> = HashMap::new();
        for event in &history {
            if let Event::PropertyCreated { property } = event {
                states
                    .entry(property.id)
                    .or_insert_with(|| PropertyState::new(property.clone()));
                continue;
            }
            match event.property_id() {
                Some(pid) => match states.get_mut(&pid) {
                    Some(ps) => apply_to_property(ps, event, &store),
                    None => tracing::warn!(property = %pid, "replay: event for unknown property skipped"),
                },
                None => apply_global(&store, event),
            }
        }
        for (id, ps) in states {
            store.insert_property(id, Arc::new(RwLock::new(ps)));
        }
        Self {
            store,
            journal,
            write_gate: RwLock::new(()),
        }
    }

    pub fn get_property(&self, id: &Ulid) -> Option<SharedPropertyState> {
        self.store.get_property(id)
    }

    /// Property that owns a room, add-on, booking or feed.
    pub fn property_of(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.store.owner_of(entity_id)
    }

    async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.journal.append(event.clone()).await.map_err(|e| {
            tracing::error!(error = %e, "journal append failed");
            EngineError::Journal(e.to_string())
        })
    }

    /// Journal first, then apply. Nothing is applied if the journal refuses the event.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut PropertyState,
        event: Event,
    ) -> Result<(), EngineError> {
        self.journal_append(&event).await?;
        apply_to_property(ps, &event, &self.store);
        Ok(())
    }

    /// Same as `persist_and_apply` for rule events. Caller holds the write gate.
    pub(super) async fn persist_global(&self, event: Event) -> Result<(), EngineError> {
        self.journal_append(&event).await?;
        apply_global(&self.store, &event);
        Ok(())
    }

    /// Register a new property. Caller holds the write gate.
    pub(super) async fn persist_new_property(&self, property: Property) -> Result<(), EngineError> {
        let id = property.id;
        let event = Event::PropertyCreated { property: property.clone() };
        self.journal_append(&event).await?;
        self.store
            .insert_property(id, Arc::new(RwLock::new(PropertyState::new(property))));
        Ok(())
    }

    pub(super) async fn gate(&self) -> RwLockReadGuard<'_, ()> {
        self.write_gate.read().await
    }

    pub(super) async fn lock_property(&self, property_id: &Ulid) -> Result<PropertyWrite<'_>, EngineError> {
        let gate = self.write_gate.read().await;
        let shared = self
            .store
            .get_property(property_id)
            .ok_or(EngineError::NotFound(*property_id))?;
        Ok(PropertyWrite {
            _gate: gate,
            state: shared.write_owned().await,
        })
    }

    /// Lock the property owning `entity_id`.
    pub(super) async fn lock_owner(&self, entity_id: &Ulid) -> Result<PropertyWrite<'_>, EngineError> {
        let property_id = self
            .store
            .owner_of(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.lock_property(&property_id).await
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }

    /// Rewrite the journal as the minimal event list that rebuilds current state.
    pub async fn compact(&self) -> Result<usize, EngineError> {
        let _exclusive = self.write_gate.write().await;
        let mut snapshot = Vec::new();
        for id in self.store.property_ids() {
            let Some(shared) = self.store.get_property(&id) else {
                continue;
            };
            let ps = shared.read().await;
            snapshot.push(Event::PropertyCreated {
                property: ps.property.clone(),
            });
            snapshot.extend(ps.rooms.iter().cloned().map(|room| Event::RoomCreated { room }));
            snapshot.extend(ps.add_ons.iter().cloned().map(|add_on| Event::AddOnCreated { add_on }));
            snapshot.extend(ps.feeds.iter().cloned().map(|feed| Event::FeedAdded { feed }));
            snapshot.extend(
                ps.bookings
                    .iter()
                    .cloned()
                    .map(|booking| Event::BookingCreated { booking }),
            );
        }
        snapshot.extend(
            self.store
                .all_rules()
                .into_iter()
                .map(|rule| Event::RuleAdded { rule }),
        );
        let len = snapshot.len();
        self.journal
            .compact(snapshot)
            .await
            .map_err(|e| EngineError::Journal(e.to_string()))?;
        tracing::info!(events = len, "journal compacted");
        Ok(len)
    }
}
