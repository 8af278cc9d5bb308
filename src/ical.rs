//! iCalendar in both directions: external feeds become blocked stays, and each
//! room's own occupancy is published as a feed.

use chrono::{Days, NaiveDate};
use icalendar::{
    Calendar, CalendarComponent, CalendarDateTime, Component, DatePerhapsTime, Event, EventLike,
    EventStatus,
};
use ulid::Ulid;

use crate::engine::RoomCalendar;
use crate::model::{BookingStatus, Stay};

/// One usable VEVENT from a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEvent {
    pub uid: Option<String>,
    pub stay: Stay,
}

#[derive(Debug, Default)]
pub struct ParsedFeed {
    pub events: Vec<FeedEvent>,
    /// VEVENTs with no usable date range, or cancelled ones.
    pub skipped: usize,
}

fn date_of(value: DatePerhapsTime) -> NaiveDate {
    match value {
        DatePerhapsTime::Date(date) => date,
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(dt)) => dt.date(),
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(dt)) => dt.date_naive(),
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, .. }) => {
            date_time.date()
        }
    }
}

/// Date-only `[start, end)` of an event. An all-day event without DTEND lasts
/// one day; a timed one without DTEND has no range.
fn event_stay(event: &Event) -> Option<Stay> {
    let start = event.get_start()?;
    let all_day = matches!(start, DatePerhapsTime::Date(_));
    let check_in = date_of(start);
    let check_out = match event.get_end() {
        Some(end) => date_of(end),
        None if all_day => check_in.checked_add_days(Days::new(1))?,
        None => return None,
    };
    Stay::try_new(check_in, check_out)
}

pub fn parse_feed(text: &str) -> Result<ParsedFeed, String> {
    if !text
        .trim_start_matches('\u{feff}')
        .trim_start()
        .starts_with("BEGIN:VCALENDAR")
    {
        return Err("missing BEGIN:VCALENDAR".into());
    }
    let calendar = text.parse::<Calendar>().map_err(|e| e.to_string())?;
    let mut parsed = ParsedFeed::default();
    for component in calendar.components {
        let CalendarComponent::Event(event) = component else {
            continue;
        };
        if matches!(event.get_status(), Some(EventStatus::Cancelled)) {
            parsed.skipped += 1;
            continue;
        }
        match event_stay(&event) {
            Some(stay) => parsed.events.push(FeedEvent {
                uid: event.get_uid().map(str::to_string),
                stay,
            }),
            None => parsed.skipped += 1,
        }
    }
    Ok(parsed)
}

fn event_uid(booking_id: Ulid) -> String {
    format!("{booking_id}@innkeep")
}

/// Feed of the nights a room is taken. Guest details never leave the building.
pub fn export_room_calendar(calendar: &RoomCalendar) -> String {
    let mut out = Calendar::new();
    out.name(&format!("{} - {}", calendar.property_name, calendar.room.name));
    for (booking_id, stay, status) in &calendar.stays {
        let summary = match status {
            BookingStatus::Blocked => "Blocked",
            _ => "Booked",
        };
        out.push(
            Event::new()
                .uid(&event_uid(*booking_id))
                .summary(summary)
                .starts(stay.check_in)
                .ends(stay.check_out)
                .done(),
        );
    }
    out.done().to_string()
}
