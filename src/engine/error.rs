use std::fmt;

use ulid::Ulid;

use crate::model::{BookingStatus, PaymentStatus, Stay};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or out-of-range input.
    Validation(String),
    /// Requested rooms are held by another booking for an overlapping stay.
    Conflict { booking_id: Ulid, stay: Stay },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidStatusTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    InvalidPaymentTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    /// Another write with the same correlation key has not finished yet.
    InFlight(String),
    LimitExceeded(&'static str),
    Journal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Worth retrying as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::InFlight(_) | EngineError::Journal(_))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Conflict { booking_id, stay } => {
                write!(f, "rooms unavailable: overlaps booking {booking_id} for {stay}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidStatusTransition { from, to } => {
                write!(f, "booking cannot move from {from} to {to}")
            }
            EngineError::InvalidPaymentTransition { from, to } => {
                write!(f, "payment cannot move from {from} to {to}")
            }
            EngineError::InFlight(key) => {
                write!(f, "a write for {key} is already in progress, retry shortly")
            }
            EngineError::LimitExceeded(what) => write!(f, "limit exceeded: {what}"),
            EngineError::Journal(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
