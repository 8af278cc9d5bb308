//! Payment-provider callbacks: turning a completed checkout session into a
//! confirmed booking, at most once per session.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use ulid::Ulid;

use crate::engine::{BookingRequest, BookingWrite, Engine, EngineError, WriteOrigin};
use crate::model::*;
use crate::observability;

/// A checkout-completed callback as delivered by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    pub session_id: String,
    pub paid: bool,
    /// Flat string metadata attached to the checkout session.
    pub metadata: HashMap<String, String>,
}

impl PaymentEvent {
    /// Build from the raw metadata JSON. Anything that is not a JSON object
    /// reads as an empty bag; nested values are kept as their JSON text.
    pub fn new(session_id: impl Into<String>, paid: bool, metadata_json: Option<&str>) -> Self {
        let metadata = metadata_json
            .and_then(|raw| serde_json::from_str::<serde_json::Map<String, Value>>(raw).ok())
            .map(|map| {
                map.into_iter()
                    .filter_map(|(k, v)| match v {
                        Value::Null => None,
                        Value::String(s) => Some((k, s)),
                        other => Some((k, other.to_string())),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            session_id: session_id.into(),
            paid,
            metadata,
        }
    }

    fn field(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.field(key).and_then(|s| s.parse().ok())
    }

    /// Dates arrive either as `YYYY-MM-DD` or as a full ISO timestamp.
    fn date(&self, key: &str) -> Option<NaiveDate> {
        let raw = self.field(key)?;
        let day = raw.get(..10).unwrap_or(raw);
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }

    /// Ids from a JSON-array string. Malformed JSON is an empty list, and
    /// entries that are not ids are dropped.
    fn id_list(&self, key: &str) -> Vec<Ulid> {
        let Some(raw) = self.field(key) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<Value>>(raw) {
            Ok(items) => items
                .iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| Ulid::from_string(s.trim()).ok())
                .collect(),
            Err(e) => {
                tracing::warn!(session = %self.session_id, field = key, error = %e, "malformed list in payment metadata, treating as empty");
                Vec::new()
            }
        }
    }

    fn is_whole_property(&self) -> bool {
        matches!(
            self.field("booking_type"),
            Some("whole_property" | "whole-property" | "wholeProperty" | "whole" | "property")
        )
    }

    /// The booking this session paid for, or the reason it cannot be one.
    pub fn booking_request(&self) -> Result<BookingRequest, String> {
        let property_id = self
            .field("property_id")
            .ok_or("metadata has no property_id")?;
        let property_id =
            Ulid::from_string(property_id).map_err(|e| format!("bad property_id: {e}"))?;
        let check_in = self.date("check_in").ok_or("metadata has no valid check_in")?;
        let check_out = self.date("check_out").ok_or("metadata has no valid check_out")?;

        let occupancy = if self.is_whole_property() {
            Occupancy::WholeProperty
        } else {
            Occupancy::Rooms(self.id_list("selected_rooms"))
        };
        let charged = match (
            self.parsed::<Decimal>("base_price"),
            self.parsed::<Decimal>("total_price"),
        ) {
            (Some(base), Some(total)) => Some((base, total)),
            _ => None,
        };

        Ok(BookingRequest {
            id: None,
            property_id,
            occupancy,
            check_in,
            check_out,
            guests: self.parsed("guests").unwrap_or(1),
            guest: GuestInfo {
                first_name: self.field("guest_first_name").unwrap_or_default().to_string(),
                last_name: self.field("guest_last_name").unwrap_or_default().to_string(),
                email: self.field("guest_email").unwrap_or_default().to_string(),
                phone: self.field("guest_phone").map(str::to_string),
                special_requests: self.field("special_requests").map(str::to_string),
            },
            add_ons: self.id_list("add_ons"),
            correlation_key: Some(self.session_id.clone()),
            charged,
        })
    }
}

/// What happened to a callback. Every variant is acknowledged to the provider;
/// only an `Err` from [`handle_payment_event`] asks it to redeliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// Not a successful payment; nothing to do.
    Ignored,
    Recorded(Booking),
    /// This session already produced a booking.
    Duplicate(Booking),
    /// Paid, but the dates were taken in the meantime. Needs a human.
    Unplaceable { blocking: Ulid },
    /// Paid, but the metadata does not describe a bookable stay.
    Rejected(String),
}

impl PaymentOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PaymentOutcome::Ignored => "ignored",
            PaymentOutcome::Recorded(_) => "recorded",
            PaymentOutcome::Duplicate(_) => "duplicate",
            PaymentOutcome::Unplaceable { .. } => "unplaceable",
            PaymentOutcome::Rejected(_) => "rejected",
        }
    }
}

/// Write the booking a paid session describes. Transient failures come back as
/// `Err` so the provider retries; everything else is settled here.
pub async fn handle_payment_event(
    engine: &Engine,
    event: &PaymentEvent,
) -> Result<PaymentOutcome, EngineError> {
    let outcome = settle(engine, event).await;
    let label = match &outcome {
        Ok(o) => o.label(),
        Err(_) => "retry",
    };
    metrics::counter!(observability::PAYMENT_EVENTS, "outcome" => label).increment(1);
    outcome
}

async fn settle(engine: &Engine, event: &PaymentEvent) -> Result<PaymentOutcome, EngineError> {
    if !event.paid {
        tracing::debug!(session = %event.session_id, "unpaid session ignored");
        return Ok(PaymentOutcome::Ignored);
    }
    if event.session_id.trim().is_empty() {
        return Ok(PaymentOutcome::Rejected("missing session id".into()));
    }

    // A redelivery is answered before the metadata is looked at again.
    if let Some(existing) = engine.booking_by_correlation_key(&event.session_id).await? {
        metrics::counter!(observability::DUPLICATE_DELIVERIES).increment(1);
        tracing::info!(session = %event.session_id, booking = %existing.id, "duplicate payment callback");
        return Ok(PaymentOutcome::Duplicate(existing));
    }

    let request = match event.booking_request() {
        Ok(r) => r,
        Err(reason) => {
            tracing::error!(session = %event.session_id, %reason, "paid session has unusable metadata");
            return Ok(PaymentOutcome::Rejected(reason));
        }
    };

    match engine.create_booking(request, WriteOrigin::PaymentWebhook).await {
        Ok(BookingWrite::Created(booking)) => Ok(PaymentOutcome::Recorded(booking)),
        Ok(BookingWrite::Duplicate(booking)) => Ok(PaymentOutcome::Duplicate(booking)),
        Err(EngineError::Conflict { booking_id, stay }) => {
            tracing::error!(
                session = %event.session_id,
                %stay,
                blocking = %booking_id,
                "paid booking could not be placed: dates no longer available"
            );
            Ok(PaymentOutcome::Unplaceable {
                blocking: booking_id,
            })
        }
        Err(e) if e.is_transient() => Err(e),
        Err(e) => {
            tracing::error!(session = %event.session_id, error = %e, "paid booking rejected");
            Ok(PaymentOutcome::Rejected(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(metadata: &str) -> PaymentEvent {
        PaymentEvent::new("cs_test_1", true, Some(metadata))
    }

    #[test]
    fn metadata_must_be_an_object() {
        assert!(PaymentEvent::new("cs", true, Some("not json")).metadata.is_empty());
        assert!(PaymentEvent::new("cs", true, Some("[1,2]")).metadata.is_empty());
        assert!(PaymentEvent::new("cs", true, None).metadata.is_empty());
    }

    #[test]
    fn numbers_are_kept_as_text() {
        let e = event(r#"{"guests": 3, "total_price": 300.5, "phone": null}"#);
        assert_eq!(e.metadata.get("guests").map(String::as_str), Some("3"));
        assert_eq!(e.parsed::<u32>("guests"), Some(3));
        assert!(!e.metadata.contains_key("phone"));
    }

    #[test]
    fn malformed_lists_read_as_empty() {
        let e = event(r#"{"selected_rooms": "[not json", "add_ons": "{\"a\":1}"}"#);
        assert!(e.id_list("selected_rooms").is_empty());
        assert!(e.id_list("add_ons").is_empty());
        assert!(e.id_list("missing").is_empty());
    }

    #[test]
    fn request_from_metadata() {
        let pid = Ulid::new();
        let room = Ulid::new();
        let e = event(&format!(
            r#"{{"property_id": "{pid}", "check_in": "2025-06-06T00:00:00.000Z",
                "check_out": "2025-06-08", "selected_rooms": "[\"{room}\", \"junk\"]",
                "guests": "2", "guest_first_name": "Ada", "guest_last_name": "Lovelace",
                "guest_email": "ada@example.com", "base_price": "240", "total_price": "300"}}"#
        ));
        let req = e.booking_request().unwrap();
        assert_eq!(req.property_id, pid);
        assert_eq!(req.check_in, NaiveDate::from_ymd_opt(2025, 6, 6).unwrap());
        assert_eq!(req.occupancy, Occupancy::Rooms(vec![room]));
        assert_eq!(req.guests, 2);
        assert_eq!(req.correlation_key.as_deref(), Some("cs_test_1"));
        assert_eq!(req.charged, Some((Decimal::from(240), Decimal::from(300))));
    }

    #[test]
    fn whole_property_ignores_room_list() {
        let e = event(&format!(
            r#"{{"property_id": "{}", "check_in": "2025-06-06", "check_out": "2025-06-08",
                "booking_type": "whole_property", "selected_rooms": "[\"{}\"]"}}"#,
            Ulid::new(),
            Ulid::new()
        ));
        assert_eq!(e.booking_request().unwrap().occupancy, Occupancy::WholeProperty);
    }

    #[test]
    fn missing_dates_are_reported() {
        let e = event(&format!(r#"{{"property_id": "{}"}}"#, Ulid::new()));
        assert!(e.booking_request().unwrap_err().contains("check_in"));
    }

    #[tokio::test]
    async fn unpaid_sessions_are_ignored() {
        let engine = Engine::in_memory();
        let e = PaymentEvent::new("cs_unpaid", false, Some("{}"));
        assert_eq!(
            handle_payment_event(&engine, &e).await.unwrap(),
            PaymentOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn unknown_property_is_rejected_not_retried() {
        let engine = Engine::in_memory();
        let e = event(&format!(
            r#"{{"property_id": "{}", "check_in": "2025-06-06", "check_out": "2025-06-08",
                "booking_type": "whole_property", "guest_first_name": "Ada",
                "guest_last_name": "Lovelace", "guest_email": "ada@example.com"}}"#,
            Ulid::new()
        ));
        let outcome = handle_payment_event(&engine, &e).await.unwrap();
        assert!(matches!(outcome, PaymentOutcome::Rejected(_)), "{outcome:?}");
    }
}
