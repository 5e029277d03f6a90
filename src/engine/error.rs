use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{DateSpan, ReservationStatus};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid date range: start must be before end")]
    InvalidRange,
    #[error("start date {start} is before today ({today})")]
    PastStartDate { start: NaiveDate, today: NaiveDate },
    #[error("owners cannot book their own car")]
    SelfBookingNotAllowed,
    #[error("car unavailable for {span}: conflicts with reservation {conflicting}")]
    ResourceUnavailable { span: DateSpan, conflicting: Ulid },
    #[error("car not found: {0}")]
    ResourceNotFound(Ulid),
    #[error("reservation not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("cannot move reservation from {from} to {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("not permitted: {0}")]
    NotPermitted(&'static str),
    #[error("car {0} still has active reservations")]
    HasActiveReservations(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidRange | EngineError::PastStartDate { .. } => "22007",
            EngineError::SelfBookingNotAllowed | EngineError::NotPermitted(_) => "42501",
            EngineError::ResourceUnavailable { .. } => "23P01", // exclusion_violation
            EngineError::ResourceNotFound(_) | EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::InvalidTransition { .. } | EngineError::HasActiveReservations(_) => "55000",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidRange => "invalid_range",
            EngineError::PastStartDate { .. } => "past_start_date",
            EngineError::SelfBookingNotAllowed => "self_booking",
            EngineError::ResourceUnavailable { .. } => "unavailable",
            EngineError::ResourceNotFound(_) => "car_not_found",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::NotPermitted(_) => "not_permitted",
            EngineError::HasActiveReservations(_) => "has_active_reservations",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}
