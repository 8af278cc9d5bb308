use chrono::NaiveDate;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::{find_conflict, resolve_rooms};
use super::pricing::{calculate_price, round_money};
use super::store::ClaimOutcome;
use super::{Engine, EngineError};

/// Who is asking for a booking, which fixes its initial status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// Booking form or admin tool, before payment: `pending` / `pending`.
    Direct { source: BookingSource },
    /// Verified payment callback: `confirmed` / `paid`.
    PaymentWebhook,
}

#[derive(Debug, Clone)]
pub struct BookingRequest {
    /// Client-chosen id; generated when absent.
    pub id: Option<Ulid>,
    pub property_id: Ulid,
    pub occupancy: Occupancy,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub guests: u32,
    pub guest: GuestInfo,
    pub add_ons: Vec<Ulid>,
    pub correlation_key: Option<String>,
    /// `(base, total)` the guest was actually charged. Recorded instead of a fresh
    /// quote when both are present and non-negative.
    pub charged: Option<(Decimal, Decimal)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingWrite {
    Created(Booking),
    /// The correlation key was already used; this is the booking it produced.
    Duplicate(Booking),
}

impl BookingWrite {
    pub fn booking(&self) -> &Booking {
        match self {
            BookingWrite::Created(b) | BookingWrite::Duplicate(b) => b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockInsert {
    Inserted(Ulid),
    /// A block with exactly this room and stay already exists.
    AlreadyBlocked,
}

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn require(value: &str, field: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::validation(format!("{field} is required")));
    }
    Ok(())
}

/// The email shape is only checked for direct bookings; a paid session is
/// taken with whatever address the payment provider accepted.
fn validate_guest(guest: &GuestInfo, check_email_shape: bool) -> Result<(), EngineError> {
    require(&guest.first_name, "first_name")?;
    require(&guest.last_name, "last_name")?;
    require(&guest.email, "email")?;
    check_len(&guest.first_name, MAX_NAME_LEN, "first_name too long")?;
    check_len(&guest.last_name, MAX_NAME_LEN, "last_name too long")?;
    check_len(&guest.email, MAX_EMAIL_LEN, "email too long")?;
    if let Some(phone) = &guest.phone {
        check_len(phone, MAX_NAME_LEN, "phone too long")?;
    }
    if let Some(notes) = &guest.special_requests {
        check_len(notes, MAX_TEXT_LEN, "special_requests too long")?;
    }
    if !check_email_shape {
        return Ok(());
    }
    let email = guest.email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(EngineError::validation(format!("invalid email address: {email}"))),
    }
}

fn validate_stay(check_in: NaiveDate, check_out: NaiveDate) -> Result<Stay, EngineError> {
    let stay = Stay::try_new(check_in, check_out).ok_or_else(|| {
        EngineError::validation(format!(
            "check_in ({check_in}) must be before check_out ({check_out})"
        ))
    })?;
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(stay)
}

fn validate_request(req: &BookingRequest, origin: &WriteOrigin) -> Result<Stay, EngineError> {
    validate_guest(&req.guest, matches!(origin, WriteOrigin::Direct { .. }))?;
    let stay = validate_stay(req.check_in, req.check_out)?;
    if req.guests == 0 {
        return Err(EngineError::validation("guests must be at least 1"));
    }
    if req.guests > MAX_GUESTS {
        return Err(EngineError::LimitExceeded("too many guests"));
    }
    if req.occupancy.room_ids().len() > MAX_ROOMS_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many rooms in one booking"));
    }
    if req.add_ons.len() > MAX_ADD_ONS_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many add-ons in one booking"));
    }
    if let Some(key) = &req.correlation_key {
        require(key, "correlation key")?;
        check_len(key, MAX_CORRELATION_KEY_LEN, "correlation key too long")?;
    }
    Ok(stay)
}

fn validate_money(value: Decimal, field: &str) -> Result<(), EngineError> {
    if value.is_sign_negative() {
        return Err(EngineError::validation(format!("{field} must not be negative")));
    }
    Ok(())
}

fn validate_property(property: &Property) -> Result<(), EngineError> {
    require(&property.name, "name")?;
    check_len(&property.name, MAX_NAME_LEN, "property name too long")?;
    if let Some(rate) = property.whole_property_rate {
        validate_money(rate, "whole_property_rate")?;
    }
    Ok(())
}

fn validate_room(room: &Room) -> Result<(), EngineError> {
    require(&room.name, "name")?;
    check_len(&room.name, MAX_NAME_LEN, "room name too long")?;
    if let Some(bed) = &room.bed_type {
        check_len(bed, MAX_NAME_LEN, "bed_type too long")?;
    }
    if room.capacity == 0 {
        return Err(EngineError::validation("capacity must be at least 1"));
    }
    if room.features.len() > MAX_FEATURES_PER_ROOM || room.features.iter().any(|f| f.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("too many or too long room features"));
    }
    validate_money(room.base_price, "base_price")
}

fn validate_add_on(add_on: &AddOn) -> Result<(), EngineError> {
    require(&add_on.name, "name")?;
    check_len(&add_on.name, MAX_NAME_LEN, "add-on name too long")?;
    validate_money(add_on.price, "price")
}

fn validate_rule_shape(rule: &PricingRule) -> Result<(), EngineError> {
    match &rule.kind {
        RuleKind::Seasonal(w) | RuleKind::LastMinute(w) | RuleKind::AdvanceBooking(w) => {
            if w.start > w.end {
                return Err(EngineError::validation("start_date must not be after end_date"));
            }
        }
        RuleKind::Weekend(days) | RuleKind::DayOfWeek(days) => {
            if days.is_empty() {
                return Err(EngineError::validation("days_of_week must name at least one day"));
            }
        }
        RuleKind::LengthOfStay { minimum_nights } => {
            if *minimum_nights == 0 {
                return Err(EngineError::validation("minimum_stay must be at least 1"));
            }
        }
    }
    if let Modifier::Percentage(p) = rule.modifier
        && p < Decimal::from(-100)
    {
        return Err(EngineError::validation("percentage modifier below -100"));
    }
    Ok(())
}

fn normalize_feed_url(url: &str) -> Result<String, EngineError> {
    let url = url.trim();
    check_len(url, MAX_URL_LEN, "feed url too long")?;
    if let Some(rest) = url.strip_prefix("webcal://") {
        return Ok(format!("https://{rest}"));
    }
    if url.starts_with("https://") || url.starts_with("http://") {
        return Ok(url.to_string());
    }
    Err(EngineError::validation(format!("unsupported feed url: {url}")))
}

fn status_move_allowed(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) | (Confirmed, Completed)
    )
}

fn payment_move_allowed(from: PaymentStatus, to: PaymentStatus) -> bool {
    use PaymentStatus::*;
    matches!((from, to), (Pending, Paid) | (Paid, Refunded))
}

impl Engine {
    // ── Catalogue ────────────────────────────────────────────

    pub async fn create_property(&self, property: Property) -> Result<(), EngineError> {
        validate_property(&property)?;
        let _gate = self.gate().await;
        if self.store.property_count() >= MAX_PROPERTIES {
            return Err(EngineError::LimitExceeded("too many properties"));
        }
        if self.store.is_known_entity(&property.id) {
            return Err(EngineError::AlreadyExists(property.id));
        }
        let id = property.id;
        self.persist_new_property(property).await?;
        tracing::info!(property = %id, "property created");
        Ok(())
    }

    pub async fn update_property(&self, property: Property) -> Result<(), EngineError> {
        validate_property(&property)?;
        let mut txn = self.lock_property(&property.id).await?;
        self.persist_and_apply(&mut txn.state, Event::PropertyUpdated { property })
            .await
    }

    pub async fn create_room(&self, room: Room) -> Result<(), EngineError> {
        validate_room(&room)?;
        let mut txn = self.lock_property(&room.property_id).await?;
        if txn.state.rooms.len() >= MAX_ROOMS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.store.is_known_entity(&room.id) {
            return Err(EngineError::AlreadyExists(room.id));
        }
        self.persist_and_apply(&mut txn.state, Event::RoomCreated { room })
            .await
    }

    pub async fn update_room(&self, room: Room) -> Result<(), EngineError> {
        validate_room(&room)?;
        let mut txn = self.lock_owner(&room.id).await?;
        match txn.state.room(&room.id) {
            Some(existing) if existing.property_id == room.property_id => {}
            Some(_) => return Err(EngineError::validation("a room cannot move between properties")),
            None => return Err(EngineError::NotFound(room.id)),
        }
        self.persist_and_apply(&mut txn.state, Event::RoomUpdated { room })
            .await
    }

    pub async fn create_add_on(&self, add_on: AddOn) -> Result<(), EngineError> {
        validate_add_on(&add_on)?;
        let mut txn = self.lock_property(&add_on.property_id).await?;
        if txn.state.add_ons.len() >= MAX_ADD_ONS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many add-ons"));
        }
        if self.store.is_known_entity(&add_on.id) {
            return Err(EngineError::AlreadyExists(add_on.id));
        }
        self.persist_and_apply(&mut txn.state, Event::AddOnCreated { add_on })
            .await
    }

    pub async fn update_add_on(&self, add_on: AddOn) -> Result<(), EngineError> {
        validate_add_on(&add_on)?;
        let mut txn = self.lock_owner(&add_on.id).await?;
        match txn.state.add_on(&add_on.id) {
            Some(existing) if existing.property_id == add_on.property_id => {}
            Some(_) => return Err(EngineError::validation("an add-on cannot move between properties")),
            None => return Err(EngineError::NotFound(add_on.id)),
        }
        self.persist_and_apply(&mut txn.state, Event::AddOnUpdated { add_on })
            .await
    }

    /// Property and add-on references of a rule must exist and agree.
    async fn check_rule_scope(&self, rule: &PricingRule) -> Result<(), EngineError> {
        if let Some(pid) = rule.property_id
            && !self.store.contains_property(&pid)
        {
            return Err(EngineError::NotFound(pid));
        }
        if let Some(add_on_id) = rule.add_on_id {
            let owner = self
                .store
                .owner_of(&add_on_id)
                .ok_or(EngineError::NotFound(add_on_id))?;
            let is_add_on = match self.store.get_property(&owner) {
                Some(shared) => shared.read().await.add_on(&add_on_id).is_some(),
                None => false,
            };
            if !is_add_on {
                return Err(EngineError::NotFound(add_on_id));
            }
            if rule.property_id.is_some_and(|p| p != owner) {
                return Err(EngineError::validation(
                    "add_on_id belongs to a different property",
                ));
            }
        }
        Ok(())
    }

    pub async fn add_rule(&self, rule: PricingRule) -> Result<(), EngineError> {
        validate_rule_shape(&rule)?;
        let _gate = self.gate().await;
        if self.store.rule_count() >= MAX_PRICING_RULES {
            return Err(EngineError::LimitExceeded("too many pricing rules"));
        }
        if self.store.get_rule(&rule.id).is_some() || self.store.is_known_entity(&rule.id) {
            return Err(EngineError::AlreadyExists(rule.id));
        }
        self.check_rule_scope(&rule).await?;
        self.persist_global(Event::RuleAdded { rule }).await
    }

    pub async fn update_rule(&self, rule: PricingRule) -> Result<(), EngineError> {
        validate_rule_shape(&rule)?;
        let _gate = self.gate().await;
        if self.store.get_rule(&rule.id).is_none() {
            return Err(EngineError::NotFound(rule.id));
        }
        self.check_rule_scope(&rule).await?;
        self.persist_global(Event::RuleUpdated { rule }).await
    }

    pub async fn remove_rule(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.gate().await;
        if self.store.get_rule(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        self.persist_global(Event::RuleRemoved { id }).await
    }

    pub async fn add_feed(&self, id: Ulid, room_id: Ulid, url: &str) -> Result<FeedSubscription, EngineError> {
        let url = normalize_feed_url(url)?;
        let mut txn = self.lock_owner(&room_id).await?;
        if txn.state.room(&room_id).is_none() {
            return Err(EngineError::NotFound(room_id));
        }
        if self.store.is_known_entity(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let ps = &mut *txn.state;
        let feeds = ps.feeds.iter().filter(|f| f.room_id == room_id);
        if feeds.clone().count() >= MAX_FEEDS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many feeds for room"));
        }
        if feeds.clone().any(|f| f.url == url) {
            return Err(EngineError::validation("feed already subscribed for this room"));
        }
        let feed = FeedSubscription {
            id,
            property_id: ps.property.id,
            room_id,
            url,
        };
        self.persist_and_apply(ps, Event::FeedAdded { feed: feed.clone() })
            .await?;
        Ok(feed)
    }

    pub async fn remove_feed(&self, id: Ulid) -> Result<(), EngineError> {
        let mut txn = self.lock_owner(&id).await?;
        let ps = &mut *txn.state;
        if !ps.feeds.iter().any(|f| f.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let property_id = ps.property.id;
        self.persist_and_apply(ps, Event::FeedRemoved { id, property_id })
            .await
    }

    // ── Booking writer ───────────────────────────────────────

    /// Validate, claim the correlation key, then re-check availability and write
    /// under the property lock. At most one booking exists per correlation key.
    pub async fn create_booking(
        &self,
        req: BookingRequest,
        origin: WriteOrigin,
    ) -> Result<BookingWrite, EngineError> {
        let stay = validate_request(&req, &origin)?;

        let _claim = match req.correlation_key.as_deref() {
            Some(key) => match self.store.claim(key) {
                ClaimOutcome::Claimed(guard) => Some(guard),
                ClaimOutcome::Committed(existing) => {
                    metrics::counter!(observability::DUPLICATE_DELIVERIES).increment(1);
                    tracing::info!(correlation_key = key, booking = %existing, "duplicate delivery, booking already recorded");
                    return Ok(BookingWrite::Duplicate(self.booking(&existing).await?));
                }
                ClaimOutcome::InFlight => return Err(EngineError::InFlight(key.to_string())),
            },
            None => None,
        };

        let id = req.id.unwrap_or_else(Ulid::new);
        let rules = self.store.rules_for(&req.property_id);
        let mut txn = self.lock_property(&req.property_id).await?;
        let ps = &mut *txn.state;

        if self.store.is_known_entity(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if ps.bookings.len() >= MAX_BOOKINGS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many bookings for property"));
        }

        let rooms = resolve_rooms(ps, &req.occupancy)?;
        let capacity: u32 = rooms
            .iter()
            .filter_map(|r| ps.room(r))
            .map(|r| r.capacity)
            .sum();
        if req.guests > capacity {
            return Err(EngineError::validation(format!(
                "{} guests exceed the capacity of the selected rooms ({capacity})",
                req.guests
            )));
        }

        if let Some(conflict) = find_conflict(ps, &stay, &req.occupancy, &rooms) {
            metrics::counter!(observability::BOOKING_CONFLICTS).increment(1);
            tracing::debug!(property = %req.property_id, %stay, blocking = %conflict.booking_id, "booking conflict");
            return Err(EngineError::Conflict {
                booking_id: conflict.booking_id,
                stay: conflict.stay,
            });
        }

        let quote = calculate_price(ps, &rules, &stay, &req.occupancy, &rooms, &req.add_ons)?;
        let (base_price, total_price) = match req.charged {
            Some((base, total)) if !base.is_sign_negative() && !total.is_sign_negative() => {
                if round_money(total) != quote.total_price {
                    tracing::warn!(
                        booking = %id,
                        charged = %total,
                        quoted = %quote.total_price,
                        "charged amount differs from current quote"
                    );
                }
                (round_money(base), round_money(total))
            }
            _ => (quote.base_price, quote.total_price),
        };

        let (status, payment_status, source) = match origin {
            WriteOrigin::Direct { source } => (BookingStatus::Pending, PaymentStatus::Pending, source),
            WriteOrigin::PaymentWebhook => {
                (BookingStatus::Confirmed, PaymentStatus::Paid, BookingSource::Direct)
            }
        };
        let now = now_ms();
        let occupancy = match req.occupancy {
            Occupancy::WholeProperty => Occupancy::WholeProperty,
            Occupancy::Rooms(_) => Occupancy::Rooms(rooms),
        };
        let booking = Booking {
            id,
            property_id: req.property_id,
            occupancy,
            stay,
            guests: req.guests,
            guest: req.guest,
            add_ons: req.add_ons,
            base_price,
            total_price,
            status,
            payment_status,
            source,
            correlation_key: req.correlation_key,
            created_at: now,
            updated_at: now,
        };

        self.persist_and_apply(ps, Event::BookingCreated { booking: booking.clone() })
            .await?;
        metrics::counter!(observability::BOOKINGS_CREATED, "source" => source.as_str())
            .increment(1);
        tracing::info!(
            booking = %booking.id,
            property = %booking.property_id,
            %stay,
            source = source.as_str(),
            status = status.as_str(),
            "booking created"
        );
        Ok(BookingWrite::Created(booking))
    }

    pub async fn update_booking_status(
        &self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let mut txn = self.lock_owner(&id).await?;
        let ps = &mut *txn.state;
        let current = ps.booking(&id).ok_or(EngineError::NotFound(id))?;
        if current.status == status {
            return Ok(current.clone());
        }
        if !status_move_allowed(current.status, status) {
            return Err(EngineError::InvalidStatusTransition {
                from: current.status,
                to: status,
            });
        }
        let event = Event::BookingUpdated {
            id,
            property_id: ps.property.id,
            status,
            payment_status: current.payment_status,
            updated_at: now_ms(),
        };
        self.persist_and_apply(ps, event).await?;
        tracing::info!(booking = %id, status = status.as_str(), "booking status changed");
        ps.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn update_payment_status(
        &self,
        id: Ulid,
        payment_status: PaymentStatus,
    ) -> Result<Booking, EngineError> {
        let mut txn = self.lock_owner(&id).await?;
        let ps = &mut *txn.state;
        let current = ps.booking(&id).ok_or(EngineError::NotFound(id))?;
        if current.payment_status == payment_status {
            return Ok(current.clone());
        }
        if !payment_move_allowed(current.payment_status, payment_status) {
            return Err(EngineError::InvalidPaymentTransition {
                from: current.payment_status,
                to: payment_status,
            });
        }
        let event = Event::BookingUpdated {
            id,
            property_id: ps.property.id,
            status: current.status,
            payment_status,
            updated_at: now_ms(),
        };
        self.persist_and_apply(ps, event).await?;
        ps.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    // ── External blocks ──────────────────────────────────────

    /// Record an external calendar hold on one room. Idempotent on (room, stay).
    /// An overlap with a live booking is still recorded: the hold exists elsewhere
    /// whether or not we agree.
    pub async fn insert_block(&self, room_id: Ulid, stay: Stay) -> Result<BlockInsert, EngineError> {
        let mut txn = self.lock_owner(&room_id).await?;
        let ps = &mut *txn.state;
        if ps.room(&room_id).is_none() {
            return Err(EngineError::NotFound(room_id));
        }
        let duplicate = ps.overlapping(&stay).any(|b| {
            b.status == BookingStatus::Blocked && b.stay == stay && b.holds_room(&room_id)
        });
        if duplicate {
            return Ok(BlockInsert::AlreadyBlocked);
        }
        if ps.bookings.len() >= MAX_BOOKINGS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many bookings for property"));
        }
        if let Some(clash) = find_conflict(ps, &stay, &Occupancy::Rooms(vec![room_id]), &[room_id])
            && clash.status != BookingStatus::Blocked
        {
            metrics::counter!(observability::DOUBLE_BOOKINGS_DETECTED).increment(1);
            tracing::warn!(
                room = %room_id,
                %stay,
                booking = %clash.booking_id,
                "external calendar hold overlaps a booking made here"
            );
        }

        let now = now_ms();
        let booking = Booking {
            id: Ulid::new(),
            property_id: ps.property.id,
            occupancy: Occupancy::Rooms(vec![room_id]),
            stay,
            guests: 0,
            guest: GuestInfo::external_block(),
            add_ons: Vec::new(),
            base_price: Decimal::ZERO,
            total_price: Decimal::ZERO,
            status: BookingStatus::Blocked,
            payment_status: PaymentStatus::NotApplicable,
            source: BookingSource::IcalImport,
            correlation_key: None,
            created_at: now,
            updated_at: now,
        };
        let id = booking.id;
        self.persist_and_apply(ps, Event::BookingCreated { booking }).await?;
        metrics::counter!(observability::BLOCKS_INSERTED).increment(1);
        Ok(BlockInsert::Inserted(id))
    }

    /// Delete blocked rows whose checkout is strictly before `today`.
    pub async fn purge_stale_blocks(&self, today: NaiveDate) -> Result<usize, EngineError> {
        let mut purged = 0;
        for property_id in self.store.property_ids() {
            let mut txn = self.lock_property(&property_id).await?;
            let ps = &mut *txn.state;
            let stale: Vec<Ulid> = ps
                .bookings
                .iter()
                .filter(|b| b.status == BookingStatus::Blocked && b.stay.check_out < today)
                .map(|b| b.id)
                .collect();
            for id in stale {
                self.persist_and_apply(ps, Event::BlockRemoved { id, property_id })
                    .await?;
                purged += 1;
            }
        }
        if purged > 0 {
            metrics::counter!(observability::BLOCKS_PURGED).increment(purged as u64);
            tracing::info!(purged, %today, "stale calendar blocks removed");
        }
        Ok(purged)
    }
}
