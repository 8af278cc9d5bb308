//! Column names on the wire and how they map onto the domain model.
//!
//! Everything that knows a snake_case column name lives here; the engine only
//! ever sees domain types.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::engine::{Availability, BookingRequest, Quote};
use crate::limits::MAX_FEATURES_PER_ROOM;
use crate::model::*;
use crate::sql::{Literal, Row, SqlError, Table};
use crate::sync::SyncReport;

fn variant<T: std::str::FromStr<Err = UnknownVariant>>(
    row: &Row,
    column: &'static str,
) -> Result<Option<T>, SqlError> {
    match row.text(column)? {
        None => Ok(None),
        Some(s) => s.parse().map(Some).map_err(|e| SqlError::bad_value(column, e)),
    }
}

fn money(value: Decimal) -> String {
    format!("{value:.2}")
}

fn date(value: NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

/// Postgres array text form: `{a,b}`.
fn array_text<T: std::fmt::Display>(items: &[T]) -> String {
    let inner: Vec<String> = items.iter().map(|i| i.to_string()).collect();
    format!("{{{}}}", inner.join(","))
}

// ── Catalogue writes ─────────────────────────────────────────────

pub fn property_from_row(row: &Row) -> Result<Property, SqlError> {
    Ok(Property {
        id: row.require_ulid("id")?,
        name: row.require_text("name")?,
        check_in_time: row.time("check_in_time")?,
        check_out_time: row.time("check_out_time")?,
        whole_property_rate: row.decimal("whole_property_rate")?,
    })
}

pub fn property_to_row(p: &Property) -> Row {
    Row::new()
        .with("id", Literal::text(p.id))
        .with("name", Literal::text(&p.name))
        .with("check_in_time", Literal::opt(p.check_in_time))
        .with("check_out_time", Literal::opt(p.check_out_time))
        .with("whole_property_rate", Literal::opt(p.whole_property_rate))
}

pub fn room_from_row(row: &Row) -> Result<Room, SqlError> {
    let features = row.list("features")?;
    if features.len() > MAX_FEATURES_PER_ROOM {
        return Err(SqlError::bad_value("features", "too many entries"));
    }
    Ok(Room {
        id: row.require_ulid("id")?,
        property_id: row.require_ulid("property_id")?,
        name: row.require_text("name")?,
        capacity: row.u32("capacity")?.unwrap_or(2),
        bed_type: row.text("bed_type")?,
        bathroom: variant(row, "bathroom")?.unwrap_or(Bathroom::Ensuite),
        base_price: row
            .decimal("base_price")?
            .ok_or(SqlError::MissingColumn("base_price"))?,
        active: row.bool("active")?.unwrap_or(true),
        features,
    })
}

pub fn room_to_row(r: &Room) -> Row {
    Row::new()
        .with("id", Literal::text(r.id))
        .with("property_id", Literal::text(r.property_id))
        .with("name", Literal::text(&r.name))
        .with("capacity", Literal::Number(r.capacity.to_string()))
        .with("bed_type", Literal::opt(r.bed_type.as_ref()))
        .with("bathroom", Literal::text(r.bathroom))
        .with("base_price", Literal::Number(r.base_price.to_string()))
        .with("active", Literal::Bool(r.active))
        .with(
            "features",
            Literal::Array(r.features.iter().map(|f| Literal::text(f)).collect()),
        )
}

pub fn add_on_from_row(row: &Row) -> Result<AddOn, SqlError> {
    Ok(AddOn {
        id: row.require_ulid("id")?,
        property_id: row.require_ulid("property_id")?,
        name: row.require_text("name")?,
        price: row.decimal("price")?.ok_or(SqlError::MissingColumn("price"))?,
        active: row.bool("active")?.unwrap_or(true),
    })
}

pub fn add_on_to_row(a: &AddOn) -> Row {
    Row::new()
        .with("id", Literal::text(a.id))
        .with("property_id", Literal::text(a.property_id))
        .with("name", Literal::text(&a.name))
        .with("price", Literal::Number(a.price.to_string()))
        .with("active", Literal::Bool(a.active))
}

fn window(row: &Row) -> Result<DateWindow, SqlError> {
    Ok(DateWindow {
        start: row.require_date("start_date")?,
        end: row.require_date("end_date")?,
    })
}

fn days(row: &Row, default: Option<DaySet>) -> Result<DaySet, SqlError> {
    let parsed = match row.get("days_of_week") {
        None | Some(Literal::Null) => None,
        Some(_) => {
            let joined = row.list("days_of_week")?.join(",");
            Some(DaySet::parse(&joined).map_err(|e| SqlError::bad_value("days_of_week", e))?)
        }
    };
    match parsed.or(default) {
        Some(set) if !set.is_empty() => Ok(set),
        _ => Err(SqlError::bad_value("days_of_week", "at least one day is required")),
    }
}

/// `type` picks the rule kind; `minimum_stay` is accepted as another name for
/// `length_of_stay`, in either the type or the column.
pub fn rule_from_row(row: &Row) -> Result<PricingRule, SqlError> {
    let kind = match row.require_text("type")?.trim().to_lowercase().as_str() {
        "seasonal" => RuleKind::Seasonal(window(row)?),
        "last_minute" => RuleKind::LastMinute(window(row)?),
        "advance_booking" => RuleKind::AdvanceBooking(window(row)?),
        "weekend" => RuleKind::Weekend(days(row, Some(DaySet::WEEKEND))?),
        "day_of_week" => RuleKind::DayOfWeek(days(row, None)?),
        "length_of_stay" | "minimum_stay" => {
            let minimum_nights = match row.u32("minimum_stay")? {
                Some(n) => n,
                None => row
                    .u32("length_of_stay")?
                    .ok_or(SqlError::MissingColumn("minimum_stay"))?,
            };
            RuleKind::LengthOfStay { minimum_nights }
        }
        other => return Err(SqlError::bad_value("type", format!("unknown rule type {other}"))),
    };
    let amount = row
        .decimal("price_modifier")?
        .ok_or(SqlError::MissingColumn("price_modifier"))?;
    let modifier = match row.text("modifier_type")?.as_deref().map(str::trim) {
        None | Some("percentage") | Some("percent") => Modifier::Percentage(amount),
        Some("fixed") => Modifier::Fixed(amount),
        Some(other) => {
            return Err(SqlError::bad_value(
                "modifier_type",
                format!("expected percentage or fixed, got {other}"),
            ));
        }
    };
    Ok(PricingRule {
        id: row.require_ulid("id")?,
        property_id: row.ulid("property_id")?,
        add_on_id: row.ulid("add_on_id")?,
        kind,
        modifier,
        active: row.bool("is_active")?.unwrap_or(true),
    })
}

pub fn rule_to_row(rule: &PricingRule) -> Row {
    let mut row = Row::new()
        .with("id", Literal::text(rule.id))
        .with("type", Literal::text(rule.kind.label()))
        .with("property_id", Literal::opt(rule.property_id))
        .with("add_on_id", Literal::opt(rule.add_on_id))
        .with("is_active", Literal::Bool(rule.active));
    match rule.kind {
        RuleKind::Seasonal(w) | RuleKind::LastMinute(w) | RuleKind::AdvanceBooking(w) => {
            row.set("start_date", Literal::text(date(w.start)));
            row.set("end_date", Literal::text(date(w.end)));
        }
        RuleKind::Weekend(set) | RuleKind::DayOfWeek(set) => {
            row.set("days_of_week", Literal::text(set));
        }
        RuleKind::LengthOfStay { minimum_nights } => {
            row.set("minimum_stay", Literal::Number(minimum_nights.to_string()));
        }
    }
    let (modifier_type, amount) = match rule.modifier {
        Modifier::Percentage(p) => ("percentage", p),
        Modifier::Fixed(f) => ("fixed", f),
    };
    row.set("modifier_type", Literal::text(modifier_type));
    row.set("price_modifier", Literal::Number(amount.to_string()));
    row
}

/// Apply an UPDATE's SET list to the current record's columns.
pub fn merged(current: Row, assignments: &Row) -> Row {
    let mut row = current;
    row.overlay(assignments);
    row
}

pub struct FeedInsert {
    pub id: Ulid,
    pub room_id: Ulid,
    pub url: String,
}

pub fn feed_from_row(row: &Row) -> Result<FeedInsert, SqlError> {
    Ok(FeedInsert {
        id: row.require_ulid("id")?,
        room_id: row.require_ulid("room_id")?,
        url: row.require_text("url")?,
    })
}

// ── Bookings ─────────────────────────────────────────────────────

/// `is_whole_property = true` books the house and any `room_ids` are ignored;
/// otherwise `room_ids` names the rooms.
pub fn occupancy_from_row(row: &Row) -> Result<Occupancy, SqlError> {
    if row.bool("is_whole_property")?.unwrap_or(false) {
        return Ok(Occupancy::WholeProperty);
    }
    Ok(Occupancy::Rooms(row.ulid_list("room_ids")?))
}

/// Booking request from an INSERT row, plus the `source` column if given.
pub fn booking_request_from_row(
    row: &Row,
) -> Result<(BookingRequest, Option<BookingSource>), SqlError> {
    let guest = GuestInfo {
        first_name: row.text("first_name")?.unwrap_or_default(),
        last_name: row.text("last_name")?.unwrap_or_default(),
        email: row.text("email")?.unwrap_or_default(),
        phone: row.text("phone")?,
        special_requests: row.text("special_requests")?,
    };
    let request = BookingRequest {
        id: row.ulid("id")?,
        property_id: row.require_ulid("property_id")?,
        occupancy: occupancy_from_row(row)?,
        check_in: row.require_date("check_in")?,
        check_out: row.require_date("check_out")?,
        guests: row.u32("guests")?.unwrap_or(1),
        guest,
        add_ons: row.ulid_list("add_ons")?,
        correlation_key: None,
        charged: None,
    };
    Ok((request, variant(row, "source")?))
}

/// The two columns an admin may change on a booking.
#[derive(Debug, Default)]
pub struct BookingPatch {
    pub status: Option<BookingStatus>,
    pub payment_status: Option<PaymentStatus>,
}

pub fn booking_patch(assignments: &Row) -> Result<BookingPatch, SqlError> {
    if let Some(column) = assignments
        .columns()
        .find(|c| !matches!(*c, "status" | "payment_status"))
    {
        return Err(SqlError::Unsupported(format!(
            "bookings.{column} cannot be changed"
        )));
    }
    Ok(BookingPatch {
        status: variant(assignments, "status")?,
        payment_status: variant(assignments, "payment_status")?,
    })
}

// ── Result sets ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Int,
    Bool,
    Numeric,
    Date,
    Json,
}

/// Rows ready for the wire, every cell already in Postgres text form.
#[derive(Debug, Default)]
pub struct ResultSet {
    pub columns: Vec<(&'static str, ColumnType)>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    fn new(columns: &[(&'static str, ColumnType)]) -> Self {
        Self {
            columns: columns.to_vec(),
            rows: Vec::new(),
        }
    }
}

use ColumnType::*;

pub const PROPERTY_COLUMNS: &[(&str, ColumnType)] = &[
    ("id", Text),
    ("name", Text),
    ("whole_property_rate", Numeric),
    ("check_in_time", Text),
    ("check_out_time", Text),
];

pub fn properties_result(properties: &[Property]) -> ResultSet {
    let mut rs = ResultSet::new(PROPERTY_COLUMNS);
    for p in properties {
        rs.rows.push(vec![
            Some(p.id.to_string()),
            Some(p.name.clone()),
            p.whole_property_rate.map(money),
            p.check_in_time.map(|t| t.format("%H:%M").to_string()),
            p.check_out_time.map(|t| t.format("%H:%M").to_string()),
        ]);
    }
    rs
}

pub const ROOM_COLUMNS: &[(&str, ColumnType)] = &[
    ("id", Text),
    ("property_id", Text),
    ("name", Text),
    ("base_price", Numeric),
    ("capacity", Int),
    ("bed_type", Text),
    ("bathroom", Text),
    ("active", Bool),
    ("features", Text),
];

pub fn rooms_result(rooms: &[Room]) -> ResultSet {
    let mut rs = ResultSet::new(ROOM_COLUMNS);
    for r in rooms {
        rs.rows.push(vec![
            Some(r.id.to_string()),
            Some(r.property_id.to_string()),
            Some(r.name.clone()),
            Some(money(r.base_price)),
            Some(r.capacity.to_string()),
            r.bed_type.clone(),
            Some(r.bathroom.to_string()),
            Some(r.active.to_string()),
            Some(array_text(&r.features)),
        ]);
    }
    rs
}

pub const ADD_ON_COLUMNS: &[(&str, ColumnType)] = &[
    ("id", Text),
    ("property_id", Text),
    ("name", Text),
    ("price", Numeric),
    ("active", Bool),
];

pub fn add_ons_result(add_ons: &[AddOn]) -> ResultSet {
    let mut rs = ResultSet::new(ADD_ON_COLUMNS);
    for a in add_ons {
        rs.rows.push(vec![
            Some(a.id.to_string()),
            Some(a.property_id.to_string()),
            Some(a.name.clone()),
            Some(money(a.price)),
            Some(a.active.to_string()),
        ]);
    }
    rs
}

pub const RULE_COLUMNS: &[(&str, ColumnType)] = &[
    ("id", Text),
    ("type", Text),
    ("property_id", Text),
    ("add_on_id", Text),
    ("start_date", Date),
    ("end_date", Date),
    ("days_of_week", Text),
    ("minimum_stay", Int),
    ("price_modifier", Numeric),
    ("modifier_type", Text),
    ("is_active", Bool),
];

pub fn rules_result(rules: &[PricingRule]) -> ResultSet {
    let mut rs = ResultSet::new(RULE_COLUMNS);
    for rule in rules {
        let row = rule_to_row(rule);
        rs.rows.push(
            RULE_COLUMNS
                .iter()
                .map(|(column, _)| row.text(column).ok().flatten())
                .collect(),
        );
    }
    rs
}

pub const FEED_COLUMNS: &[(&str, ColumnType)] = &[
    ("id", Text),
    ("property_id", Text),
    ("room_id", Text),
    ("url", Text),
];

pub fn feeds_result(feeds: &[FeedSubscription]) -> ResultSet {
    let mut rs = ResultSet::new(FEED_COLUMNS);
    for f in feeds {
        rs.rows.push(vec![
            Some(f.id.to_string()),
            Some(f.property_id.to_string()),
            Some(f.room_id.to_string()),
            Some(f.url.clone()),
        ]);
    }
    rs
}

pub const BOOKING_COLUMNS: &[(&str, ColumnType)] = &[
    ("id", Text),
    ("property_id", Text),
    ("room_ids", Text),
    ("is_whole_property", Bool),
    ("check_in", Date),
    ("check_out", Date),
    ("guests", Int),
    ("first_name", Text),
    ("last_name", Text),
    ("email", Text),
    ("phone", Text),
    ("special_requests", Text),
    ("add_ons", Text),
    ("base_price", Numeric),
    ("total_price", Numeric),
    ("status", Text),
    ("payment_status", Text),
    ("source", Text),
    ("stripe_session_id", Text),
    ("created_at", Int),
    ("updated_at", Int),
];

pub fn bookings_result(bookings: &[Booking]) -> ResultSet {
    let mut rs = ResultSet::new(BOOKING_COLUMNS);
    for b in bookings {
        rs.rows.push(vec![
            Some(b.id.to_string()),
            Some(b.property_id.to_string()),
            Some(array_text(b.occupancy.room_ids())),
            Some(b.occupancy.is_whole_property().to_string()),
            Some(date(b.stay.check_in)),
            Some(date(b.stay.check_out)),
            Some(b.guests.to_string()),
            Some(b.guest.first_name.clone()),
            Some(b.guest.last_name.clone()),
            Some(b.guest.email.clone()),
            b.guest.phone.clone(),
            b.guest.special_requests.clone(),
            Some(array_text(&b.add_ons)),
            Some(money(b.base_price)),
            Some(money(b.total_price)),
            Some(b.status.to_string()),
            Some(b.payment_status.to_string()),
            Some(b.source.to_string()),
            b.correlation_key.clone(),
            Some(b.created_at.to_string()),
            Some(b.updated_at.to_string()),
        ]);
    }
    rs
}

pub const AVAILABILITY_COLUMNS: &[(&str, ColumnType)] = &[
    ("available", Bool),
    ("conflict_booking_id", Text),
    ("conflict_check_in", Date),
    ("conflict_check_out", Date),
    ("rooms", Json),
];

pub fn availability_result(availability: &Availability) -> Result<ResultSet, serde_json::Error> {
    let mut rs = ResultSet::new(AVAILABILITY_COLUMNS);
    let conflict = availability.conflict.as_ref();
    rs.rows.push(vec![
        Some(availability.available.to_string()),
        conflict.map(|c| c.booking_id.to_string()),
        conflict.map(|c| date(c.stay.check_in)),
        conflict.map(|c| date(c.stay.check_out)),
        Some(serde_json::to_string(&availability.rooms)?),
    ]);
    Ok(rs)
}

pub const QUOTE_COLUMNS: &[(&str, ColumnType)] = &[
    ("property_id", Text),
    ("check_in", Date),
    ("check_out", Date),
    ("nights", Int),
    ("base_price", Numeric),
    ("adjustments", Numeric),
    ("accommodation_price", Numeric),
    ("add_ons_price", Numeric),
    ("total_price", Numeric),
    ("breakdown", Json),
];

pub fn quote_result(quote: &Quote) -> Result<ResultSet, serde_json::Error> {
    let mut rs = ResultSet::new(QUOTE_COLUMNS);
    let add_ons: Decimal = quote.add_ons.iter().map(|line| line.price).sum();
    rs.rows.push(vec![
        Some(quote.property_id.to_string()),
        Some(date(quote.stay.check_in)),
        Some(date(quote.stay.check_out)),
        Some(quote.nights.to_string()),
        Some(money(quote.base_price)),
        Some(money(quote.adjustment_total())),
        Some(money(quote.accommodation_price)),
        Some(money(add_ons)),
        Some(money(quote.total_price)),
        Some(serde_json::to_string(quote)?),
    ]);
    Ok(rs)
}

pub const CALENDAR_COLUMNS: &[(&str, ColumnType)] = &[("room_id", Text), ("ical", Text)];

pub fn calendar_result(room_id: Ulid, ical: String) -> ResultSet {
    let mut rs = ResultSet::new(CALENDAR_COLUMNS);
    rs.rows.push(vec![Some(room_id.to_string()), Some(ical)]);
    rs
}

pub const SYNC_COLUMNS: &[(&str, ColumnType)] = &[
    ("feeds", Int),
    ("feeds_failed", Int),
    ("blocks_inserted", Int),
    ("already_blocked", Int),
    ("events_skipped", Int),
    ("blocks_purged", Int),
    ("failures", Json),
];

pub fn sync_result(report: &SyncReport) -> Result<ResultSet, serde_json::Error> {
    let mut rs = ResultSet::new(SYNC_COLUMNS);
    rs.rows.push(vec![
        Some(report.feeds.to_string()),
        Some(report.failures.len().to_string()),
        Some(report.blocks_inserted.to_string()),
        Some(report.already_blocked.to_string()),
        Some(report.events_skipped.to_string()),
        Some(report.blocks_purged.to_string()),
        Some(serde_json::to_string(&report.failures)?),
    ]);
    Ok(rs)
}

/// Columns a SELECT on `table` returns.
pub fn columns_for(table: Table) -> &'static [(&'static str, ColumnType)] {
    match table {
        Table::Properties => PROPERTY_COLUMNS,
        Table::Rooms => ROOM_COLUMNS,
        Table::AddOns => ADD_ON_COLUMNS,
        Table::PricingRules => RULE_COLUMNS,
        Table::RoomFeeds => FEED_COLUMNS,
        Table::Bookings => BOOKING_COLUMNS,
        Table::Availability => AVAILABILITY_COLUMNS,
        Table::Quote => QUOTE_COLUMNS,
        Table::RoomCalendar => CALENDAR_COLUMNS,
        Table::CalendarSync => SYNC_COLUMNS,
        Table::PaymentEvents => &[],
    }
}
