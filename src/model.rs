use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Marketplace user identity (the pgwire login name).
pub type UserId = String;

/// Half-open day range `[start, end)`: `end` is the first day not covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateSpan {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "DateSpan start must be before end");
        Self { start, end }
    }

    /// Build a span from caller-supplied dates, `None` unless `start < end`.
    pub fn try_new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// Number of days covered (rental days).
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &DateSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }

    /// Every day in the span, ascending.
    pub fn iter_days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d < end)
    }
}

impl fmt::Display for DateSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    /// Pending and confirmed reservations block the car; cancelled ones don't.
    pub fn is_active(self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Confirmed)
    }

    /// Lifecycle edges, ignoring who asks. Cancelled is terminal.
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        matches!(
            (self, next),
            (ReservationStatus::Pending, ReservationStatus::Confirmed)
                | (ReservationStatus::Pending, ReservationStatus::Cancelled)
                | (ReservationStatus::Confirmed, ReservationStatus::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }

    /// Case-insensitive parse of the wire label.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_uppercase().as_str() {
            "PENDING" => Some(ReservationStatus::Pending),
            "CONFIRMED" => Some(ReservationStatus::Confirmed),
            "CANCELLED" | "CANCELED" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is acting on the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user: UserId,
    pub admin: bool,
}

impl Actor {
    pub fn user(user: impl Into<UserId>) -> Self {
        Self {
            user: user.into(),
            admin: false,
        }
    }

    pub fn admin(user: impl Into<UserId>) -> Self {
        Self {
            user: user.into(),
            admin: true,
        }
    }
}

/// A rental booking on a car.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub car_id: Ulid,
    pub renter_id: UserId,
    pub span: DateSpan,
    pub status: ReservationStatus,
    pub total_price_cents: Option<u64>,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    fn sort_key(&self) -> (NaiveDate, Ulid) {
        (self.span.start, self.id)
    }
}

#[derive(Debug, Clone)]
pub struct CarState {
    pub id: Ulid,
    pub owner_id: UserId,
    pub name: Option<String>,
    pub daily_rate_cents: Option<u64>,
    /// Reservations of every status, sorted by `(span.start, id)`.
    pub reservations: Vec<Reservation>,
}

impl CarState {
    pub fn new(id: Ulid, owner_id: UserId, name: Option<String>, daily_rate_cents: Option<u64>) -> Self {
        Self {
            id,
            owner_id,
            name,
            daily_rate_cents,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining `(span.start, id)` order.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let key = reservation.sort_key();
        let pos = self
            .reservations
            .binary_search_by_key(&key, Reservation::sort_key)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    pub fn active(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// Active reservations whose span overlaps `query`.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn active_overlapping(&self, query: &DateSpan) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.is_active() && r.span.end > query.start)
    }
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CarListed {
        id: Ulid,
        owner_id: UserId,
        name: Option<String>,
        daily_rate_cents: Option<u64>,
    },
    CarUpdated {
        id: Ulid,
        name: Option<String>,
        daily_rate_cents: Option<u64>,
    },
    CarDelisted {
        id: Ulid,
    },
    ReservationRequested {
        id: Ulid,
        car_id: Ulid,
        renter_id: UserId,
        span: DateSpan,
        total_price_cents: Option<u64>,
    },
    ReservationConfirmed {
        id: Ulid,
        car_id: Ulid,
    },
    ReservationCancelled {
        id: Ulid,
        car_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarInfo {
    pub id: Ulid,
    pub owner_id: UserId,
    pub name: Option<String>,
    pub daily_rate_cents: Option<u64>,
    pub active_reservations: usize,
}
