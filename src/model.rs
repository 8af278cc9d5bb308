use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate, NaiveTime, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for audit timestamps only. Stays are date-only.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Half-open date range `[check_in, check_out)`. The checkout day is not occupied,
/// so a stay ending on day X and one starting on day X never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl Stay {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        debug_assert!(check_in < check_out, "Stay check_in must be before check_out");
        Self { check_in, check_out }
    }

    /// Constructor for untrusted input: `None` unless `check_in < check_out`.
    pub fn try_new(check_in: NaiveDate, check_out: NaiveDate) -> Option<Self> {
        (check_in < check_out).then_some(Self { check_in, check_out })
    }

    /// Number of nights, never less than one.
    pub fn nights(&self) -> u32 {
        self.check_out
            .signed_duration_since(self.check_in)
            .num_days()
            .max(1) as u32
    }

    pub fn overlaps(&self, other: &Stay) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }

    /// True if `date` is one of the nights of this stay.
    pub fn contains_night(&self, date: NaiveDate) -> bool {
        self.check_in <= date && date < self.check_out
    }

    /// Each night of the stay, starting with `check_in`.
    pub fn nights_iter(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        (0..u64::from(self.nights())).filter_map(move |i| self.check_in.checked_add_days(Days::new(i)))
    }
}

impl fmt::Display for Stay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.check_in, self.check_out)
    }
}

/// Inclusive date window `[start, end]` used by seasonal-style pricing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// The window shares at least one night with the stay.
    pub fn overlaps(&self, stay: &Stay) -> bool {
        self.start < stay.check_out && self.end >= stay.check_in
    }
}

/// Set of weekdays, one bit per day counted from Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DaySet(u8);

impl DaySet {
    /// Friday and Saturday nights.
    pub const WEEKEND: DaySet = DaySet((1 << 5) | (1 << 6));

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn with(self, day: Weekday) -> Self {
        Self(self.0 | (1 << day.num_days_from_sunday()))
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_sunday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn days(&self) -> impl Iterator<Item = Weekday> + '_ {
        [
            Weekday::Sun,
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
        ]
        .into_iter()
        .filter(|d| self.contains(*d))
    }

    /// Accepts `fri,sat`, `["fri","sat"]`, full names, or numbers with 0 = Sunday.
    pub fn parse(input: &str) -> Result<Self, UnknownVariant> {
        let trimmed = input.trim().trim_start_matches('[').trim_end_matches(']');
        let mut set = DaySet::empty();
        for token in trimmed.split(',') {
            let token = token.trim().trim_matches('"').trim();
            if token.is_empty() {
                continue;
            }
            let day = match token.parse::<u8>() {
                Ok(n) => weekday_from_sunday(n),
                Err(_) => token.parse::<Weekday>().ok(),
            }
            .ok_or_else(|| UnknownVariant::new("weekday", token))?;
            set = set.with(day);
        }
        Ok(set)
    }
}

fn weekday_from_sunday(n: u8) -> Option<Weekday> {
    match n {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

impl fmt::Display for DaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .days()
            .map(|d| d.to_string().to_lowercase())
            .collect();
        write!(f, "{}", names.join(","))
    }
}

// ── Catalogue ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: Ulid,
    pub name: String,
    pub check_in_time: Option<NaiveTime>,
    pub check_out_time: Option<NaiveTime>,
    /// Flat nightly rate for booking the whole property. Not derived from room
    /// prices; `None` means whole-property bookings are not offered.
    pub whole_property_rate: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bathroom {
    Ensuite,
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub property_id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub bed_type: Option<String>,
    pub bathroom: Bathroom,
    pub base_price: Decimal,
    pub active: bool,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOn {
    pub id: Ulid,
    pub property_id: Ulid,
    pub name: String,
    pub price: Decimal,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSubscription {
    pub id: Ulid,
    pub property_id: Ulid,
    pub room_id: Ulid,
    pub url: String,
}

// ── Pricing rules ────────────────────────────────────────────────

/// What triggers a rule. Each kind carries only the condition it tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    Seasonal(DateWindow),
    LastMinute(DateWindow),
    AdvanceBooking(DateWindow),
    /// Matches when any night of the stay falls on one of the days.
    Weekend(DaySet),
    /// For add-ons, matches on the check-in weekday; for stays, on any night.
    DayOfWeek(DaySet),
    /// Pricing trigger: applies once the stay reaches `minimum_nights`.
    LengthOfStay { minimum_nights: u32 },
}

impl RuleKind {
    pub fn label(&self) -> &'static str {
        match self {
            RuleKind::Seasonal(_) => "seasonal",
            RuleKind::LastMinute(_) => "last_minute",
            RuleKind::AdvanceBooking(_) => "advance_booking",
            RuleKind::Weekend(_) => "weekend",
            RuleKind::DayOfWeek(_) => "day_of_week",
            RuleKind::LengthOfStay { .. } => "length_of_stay",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modifier {
    /// Signed percentage of the base, e.g. `25` for +25%.
    Percentage(Decimal),
    /// Signed flat amount per booking (or per add-on unit).
    Fixed(Decimal),
}

impl Modifier {
    /// Adjustment against the un-adjusted base. Rules never compound.
    pub fn delta(&self, base: Decimal) -> Decimal {
        match self {
            Modifier::Percentage(pct) => base * *pct / Decimal::ONE_HUNDRED,
            Modifier::Fixed(amount) => *amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingRule {
    pub id: Ulid,
    /// `None` = applies to every property.
    pub property_id: Option<Ulid>,
    /// `Some` = an add-on rule, priced against that add-on only.
    pub add_on_id: Option<Ulid>,
    pub kind: RuleKind,
    pub modifier: Modifier,
    pub active: bool,
}

// ── Bookings ─────────────────────────────────────────────────────

/// What a booking occupies: either the whole property or a set of rooms, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Occupancy {
    WholeProperty,
    Rooms(Vec<Ulid>),
}

impl Occupancy {
    pub fn is_whole_property(&self) -> bool {
        matches!(self, Occupancy::WholeProperty)
    }

    /// Stored room ids; empty for whole-property bookings.
    pub fn room_ids(&self) -> &[Ulid] {
        match self {
            Occupancy::WholeProperty => &[],
            Occupancy::Rooms(ids) => ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInfo {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub special_requests: Option<String>,
}

impl GuestInfo {
    /// Stand-in guest for rows imported from an external calendar.
    pub fn external_block() -> Self {
        Self {
            first_name: "External".into(),
            last_name: "Calendar".into(),
            email: "blocked@calendar.invalid".into(),
            phone: None,
            special_requests: None,
        }
    }
}

#[derive(Debug)]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Implements `as_str` / `Display` / `FromStr` for a wire-named enum.
macro_rules! wire_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal $(| $alias:literal)*),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($text $(| $alias)* => Ok($name::$variant),)+
                    other => Err(UnknownVariant::new($kind, other)),
                }
            }
        }
    };
}

wire_enum!(Bathroom, "bathroom", {
    Ensuite => "ensuite" | "en-suite" | "private",
    Shared => "shared",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    /// Synthetic hold imported from an external calendar.
    Blocked,
}

wire_enum!(BookingStatus, "booking status", {
    Pending => "pending",
    Confirmed => "confirmed",
    Cancelled => "cancelled" | "canceled",
    Completed => "completed",
    Blocked => "blocked",
});

impl BookingStatus {
    /// Whether a booking in this status holds its rooms.
    pub fn occupies(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
    NotApplicable,
}

wire_enum!(PaymentStatus, "payment status", {
    Pending => "pending",
    Paid => "paid",
    Refunded => "refunded",
    NotApplicable => "n/a" | "na",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingSource {
    Direct,
    Airbnb,
    BookingCom,
    Vrbo,
    IcalImport,
}

wire_enum!(BookingSource, "booking source", {
    Direct => "direct",
    Airbnb => "airbnb",
    BookingCom => "booking.com" | "booking_com",
    Vrbo => "vrbo",
    IcalImport => "ical-import" | "ical_import",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub property_id: Ulid,
    pub occupancy: Occupancy,
    pub stay: Stay,
    pub guests: u32,
    pub guest: GuestInfo,
    pub add_ons: Vec<Ulid>,
    pub base_price: Decimal,
    pub total_price: Decimal,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub source: BookingSource,
    /// Payment session id; unique across all bookings when present.
    pub correlation_key: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    /// True if this booking holds `room_id` (directly or as part of the whole property).
    pub fn holds_room(&self, room_id: &Ulid) -> bool {
        match &self.occupancy {
            Occupancy::WholeProperty => true,
            Occupancy::Rooms(ids) => ids.contains(room_id),
        }
    }
}

// ── Per-property state ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PropertyState {
    pub property: Property,
    pub rooms: Vec<Room>,
    pub add_ons: Vec<AddOn>,
    pub feeds: Vec<FeedSubscription>,
    /// Every booking of the property (any status), sorted by `stay.check_in`.
    pub bookings: Vec<Booking>,
}

impl PropertyState {
    pub fn new(property: Property) -> Self {
        Self {
            property,
            rooms: Vec::new(),
            add_ons: Vec::new(),
            feeds: Vec::new(),
            bookings: Vec::new(),
        }
    }

    pub fn room(&self, id: &Ulid) -> Option<&Room> {
        self.rooms.iter().find(|r| r.id == *id)
    }

    pub fn add_on(&self, id: &Ulid) -> Option<&AddOn> {
        self.add_ons.iter().find(|a| a.id == *id)
    }

    pub fn active_rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.iter().filter(|r| r.active)
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Insert a booking keeping the list sorted by check-in.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.stay.check_in <= booking.stay.check_in);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: &Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == *id)?;
        Some(self.bookings.remove(pos))
    }

    /// Bookings (any status) whose stay overlaps `query`.
    /// Everything at index >= right_bound checks in on or after `query.check_out`.
    pub fn overlapping(&self, query: &Stay) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.stay.check_in < query.check_out);
        let query = *query;
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.stay.check_out > query.check_in)
    }
}

/// Journal record. Flat and self-contained: replaying these in order rebuilds all state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PropertyCreated { property: Property },
    PropertyUpdated { property: Property },
    RoomCreated { room: Room },
    RoomUpdated { room: Room },
    AddOnCreated { add_on: AddOn },
    AddOnUpdated { add_on: AddOn },
    RuleAdded { rule: PricingRule },
    RuleUpdated { rule: PricingRule },
    RuleRemoved { id: Ulid },
    FeedAdded { feed: FeedSubscription },
    FeedRemoved { id: Ulid, property_id: Ulid },
    BookingCreated { booking: Booking },
    BookingUpdated {
        id: Ulid,
        property_id: Ulid,
        status: BookingStatus,
        payment_status: PaymentStatus,
        updated_at: Ms,
    },
    BlockRemoved { id: Ulid, property_id: Ulid },
}

impl Event {
    /// The property whose state this event changes; `None` for global pricing rules.
    pub fn property_id(&self) -> Option<Ulid> {
        match self {
            Event::PropertyCreated { property } | Event::PropertyUpdated { property } => {
                Some(property.id)
            }
            Event::RoomCreated { room } | Event::RoomUpdated { room } => Some(room.property_id),
            Event::AddOnCreated { add_on } | Event::AddOnUpdated { add_on } => {
                Some(add_on.property_id)
            }
            Event::FeedAdded { feed } => Some(feed.property_id),
            Event::BookingCreated { booking } => Some(booking.property_id),
            Event::FeedRemoved { property_id, .. }
            | Event::BookingUpdated { property_id, .. }
            | Event::BlockRemoved { property_id, .. } => Some(*property_id),
            Event::RuleAdded { .. } | Event::RuleUpdated { .. } | Event::RuleRemoved { .. } => None,
        }
    }
}
