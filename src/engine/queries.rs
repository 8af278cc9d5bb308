use chrono::NaiveDate;
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::availability::{Conflict, RoomAvailability, find_conflict, resolve_rooms, room_availability};
use super::pricing::{Quote, calculate_price};
use super::{Engine, EngineError};

#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub available: bool,
    pub conflict: Option<Conflict>,
    pub rooms: Vec<RoomAvailability>,
}

/// Input for one room's outbound calendar.
#[derive(Debug, Clone)]
pub struct RoomCalendar {
    pub property_name: String,
    pub room: Room,
    /// Confirmed and blocked stays holding the room, whole-property ones included.
    pub stays: Vec<(Ulid, Stay, BookingStatus)>,
}

fn parse_stay(check_in: NaiveDate, check_out: NaiveDate) -> Result<Stay, EngineError> {
    Stay::try_new(check_in, check_out).ok_or_else(|| {
        EngineError::validation(format!(
            "check_in ({check_in}) must be before check_out ({check_out})"
        ))
    })
}

impl Engine {
    /// Read-only availability predicate with the reason when it fails.
    pub async fn check_availability(
        &self,
        property_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        occupancy: &Occupancy,
    ) -> Result<Availability, EngineError> {
        let stay = parse_stay(check_in, check_out)?;
        let shared = self
            .get_property(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let ps = shared.read().await;
        let rooms = resolve_rooms(&ps, occupancy)?;
        let conflict = find_conflict(&ps, &stay, occupancy, &rooms);
        Ok(Availability {
            available: conflict.is_none(),
            conflict,
            rooms: room_availability(&ps, &stay),
        })
    }

    pub async fn is_available(
        &self,
        property_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        occupancy: &Occupancy,
    ) -> Result<bool, EngineError> {
        Ok(self
            .check_availability(property_id, check_in, check_out, occupancy)
            .await?
            .available)
    }

    /// Price a candidate stay against the current rules. Does not check availability.
    pub async fn quote(
        &self,
        property_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        occupancy: &Occupancy,
        add_ons: &[Ulid],
    ) -> Result<Quote, EngineError> {
        let stay = parse_stay(check_in, check_out)?;
        let rules = self.store.rules_for(&property_id);
        let shared = self
            .get_property(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let ps = shared.read().await;
        let rooms = resolve_rooms(&ps, occupancy)?;
        calculate_price(&ps, &rules, &stay, occupancy, &rooms, add_ons)
    }

    pub async fn property(&self, id: &Ulid) -> Result<Property, EngineError> {
        let shared = self.get_property(id).ok_or(EngineError::NotFound(*id))?;
        let ps = shared.read().await;
        Ok(ps.property.clone())
    }

    /// Every property, ordered by id.
    pub async fn properties(&self) -> Vec<Property> {
        let mut out = Vec::new();
        for id in self.store.property_ids() {
            if let Some(shared) = self.get_property(&id) {
                out.push(shared.read().await.property.clone());
            }
        }
        out
    }

    pub async fn rooms(&self, property_id: &Ulid) -> Result<Vec<Room>, EngineError> {
        let shared = self
            .get_property(property_id)
            .ok_or(EngineError::NotFound(*property_id))?;
        let ps = shared.read().await;
        Ok(ps.rooms.clone())
    }

    pub async fn room(&self, id: &Ulid) -> Result<Room, EngineError> {
        let shared = self.owner_state(id)?;
        let ps = shared.read().await;
        ps.room(id).cloned().ok_or(EngineError::NotFound(*id))
    }

    pub async fn add_ons(&self, property_id: &Ulid) -> Result<Vec<AddOn>, EngineError> {
        let shared = self
            .get_property(property_id)
            .ok_or(EngineError::NotFound(*property_id))?;
        let ps = shared.read().await;
        Ok(ps.add_ons.clone())
    }

    pub async fn add_on(&self, id: &Ulid) -> Result<AddOn, EngineError> {
        let shared = self.owner_state(id)?;
        let ps = shared.read().await;
        ps.add_on(id).cloned().ok_or(EngineError::NotFound(*id))
    }

    pub fn rule(&self, id: &Ulid) -> Result<PricingRule, EngineError> {
        self.store.get_rule(id).ok_or(EngineError::NotFound(*id))
    }

    /// Rules for one property (including global ones), or every rule.
    pub fn rules(&self, property_id: Option<&Ulid>) -> Vec<PricingRule> {
        match property_id {
            Some(pid) => self.store.rules_for(pid),
            None => self.store.all_rules(),
        }
    }

    pub async fn booking(&self, id: &Ulid) -> Result<Booking, EngineError> {
        let shared = self.owner_state(id)?;
        let ps = shared.read().await;
        ps.booking(id).cloned().ok_or(EngineError::NotFound(*id))
    }

    /// Booking produced by a payment session, if any.
    pub async fn booking_by_correlation_key(&self, key: &str) -> Result<Option<Booking>, EngineError> {
        match self.store.booking_for_key(key) {
            Some(id) => self.booking(&id).await.map(Some),
            None => Ok(None),
        }
    }

    /// All bookings of a property in check-in order, blocked rows included.
    pub async fn bookings(&self, property_id: &Ulid) -> Result<Vec<Booking>, EngineError> {
        let shared = self
            .get_property(property_id)
            .ok_or(EngineError::NotFound(*property_id))?;
        let ps = shared.read().await;
        Ok(ps.bookings.clone())
    }

    /// Every calendar feed subscription across all properties.
    pub async fn feed_subscriptions(&self) -> Vec<FeedSubscription> {
        let mut feeds = Vec::new();
        for id in self.store.property_ids() {
            if let Some(shared) = self.get_property(&id) {
                feeds.extend(shared.read().await.feeds.iter().cloned());
            }
        }
        feeds
    }

    pub async fn room_calendar(&self, room_id: &Ulid) -> Result<RoomCalendar, EngineError> {
        let shared = self.owner_state(room_id)?;
        let ps = shared.read().await;
        let room = ps.room(room_id).cloned().ok_or(EngineError::NotFound(*room_id))?;
        let stays = ps
            .bookings
            .iter()
            .filter(|b| matches!(b.status, BookingStatus::Confirmed | BookingStatus::Blocked))
            .filter(|b| b.holds_room(room_id))
            .map(|b| (b.id, b.stay, b.status))
            .collect();
        Ok(RoomCalendar {
            property_name: ps.property.name.clone(),
            room,
            stays,
        })
    }

    fn owner_state(&self, entity_id: &Ulid) -> Result<super::SharedPropertyState, EngineError> {
        let property_id = self
            .store
            .owner_of(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.get_property(&property_id)
            .ok_or(EngineError::NotFound(property_id))
    }
}
