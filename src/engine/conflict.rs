use chrono::{Datelike, NaiveDate};

use crate::limits::*;
use crate::model::*;

use super::availability::find_conflict;
use super::EngineError;

fn validate_date(date: NaiveDate) -> Result<(), EngineError> {
    if date.year() < MIN_VALID_YEAR || date.year() > MAX_VALID_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(())
}

/// Shape checks shared by bookings and query windows.
pub(crate) fn validate_span(span: &DateSpan) -> Result<(), EngineError> {
    if !span.is_valid() {
        return Err(EngineError::InvalidRange);
    }
    validate_date(span.start)?;
    validate_date(span.end)
}

pub(crate) fn validate_window(span: &DateSpan) -> Result<(), EngineError> {
    validate_span(span)?;
    if span.days() > MAX_QUERY_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// A bookable candidate: non-empty, not too long, not starting before `today`.
pub(crate) fn validate_candidate(span: &DateSpan, today: NaiveDate) -> Result<(), EngineError> {
    validate_span(span)?;
    if span.start < today {
        return Err(EngineError::PastStartDate {
            start: span.start,
            today,
        });
    }
    if span.days() > MAX_RENTAL_DAYS {
        return Err(EngineError::LimitExceeded("rental too long"));
    }
    Ok(())
}

pub(crate) fn check_not_owner(car: &CarState, actor: &Actor) -> Result<(), EngineError> {
    if car.owner_id == actor.user {
        return Err(EngineError::SelfBookingNotAllowed);
    }
    Ok(())
}

/// Rejects `span` if any active reservation on the car overlaps it.
pub(crate) fn check_no_conflict(car: &CarState, span: &DateSpan) -> Result<(), EngineError> {
    match find_conflict(car.active_overlapping(span), span) {
        Some(blocker) => Err(EngineError::ResourceUnavailable {
            span: *span,
            conflicting: blocker.id,
        }),
        None => Ok(()),
    }
}

pub(crate) fn authorize_car_admin(car: &CarState, actor: &Actor) -> Result<(), EngineError> {
    if actor.admin || car.owner_id == actor.user {
        Ok(())
    } else {
        Err(EngineError::NotPermitted("only the owner or an admin can manage this car"))
    }
}

/// Who may move a reservation to `next`. Owners and admins may confirm or
/// cancel; the renter may only withdraw a pending request.
pub(crate) fn authorize_transition(
    car: &CarState,
    reservation: &Reservation,
    actor: &Actor,
    next: ReservationStatus,
) -> Result<(), EngineError> {
    let from = reservation.status;
    if !from.can_transition_to(next) {
        return Err(EngineError::InvalidTransition { from, to: next });
    }
    let owner_or_admin = actor.admin || car.owner_id == actor.user;
    let renter = reservation.renter_id == actor.user;
    let allowed = match (from, next) {
        (ReservationStatus::Pending, ReservationStatus::Cancelled) => owner_or_admin || renter,
        _ => owner_or_admin,
    };
    if !allowed {
        return Err(EngineError::NotPermitted("actor may not change this reservation"));
    }
    Ok(())
}

/// `days × daily_rate`, when the car has a rate.
pub(crate) fn rental_total(car: &CarState, span: &DateSpan) -> Option<u64> {
    let days = u64::try_from(span.days()).ok()?;
    car.daily_rate_cents?.checked_mul(days)
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn car_with(reservations: Vec<(NaiveDate, NaiveDate, ReservationStatus)>) -> CarState {
        let mut car = CarState::new(Ulid::new(), "owner".into(), Some("Civic".into()), Some(4_500));
        for (start, end, status) in reservations {
            car.insert_reservation(Reservation {
                id: Ulid::new(),
                car_id: car.id,
                renter_id: "renter".into(),
                span: DateSpan::new(start, end),
                status,
                total_price_cents: None,
            });
        }
        car
    }

    #[test]
    fn candidate_rejects_empty_range() {
        let span = DateSpan { start: d(2024, 1, 10), end: d(2024, 1, 10) };
        assert!(matches!(
            validate_candidate(&span, d(2024, 1, 1)),
            Err(EngineError::InvalidRange)
        ));
    }

    #[test]
    fn candidate_rejects_past_start() {
        let span = DateSpan::new(d(2024, 1, 9), d(2024, 1, 12));
        assert!(matches!(
            validate_candidate(&span, d(2024, 1, 10)),
            Err(EngineError::PastStartDate { .. })
        ));
    }

    #[test]
    fn candidate_starting_today_is_fine() {
        let span = DateSpan::new(d(2024, 1, 10), d(2024, 1, 12));
        assert!(validate_candidate(&span, d(2024, 1, 10)).is_ok());
    }

    #[test]
    fn candidate_rejects_overlong_rental() {
        let span = DateSpan::new(d(2024, 1, 1), d(2026, 1, 1));
        assert!(matches!(
            validate_candidate(&span, d(2024, 1, 1)),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn owner_cannot_book_own_car() {
        let car = car_with(vec![]);
        assert!(matches!(
            check_not_owner(&car, &Actor::user("owner")),
            Err(EngineError::SelfBookingNotAllowed)
        ));
        assert!(check_not_owner(&car, &Actor::user("renter")).is_ok());
    }

    #[test]
    fn conflict_scenario_from_january() {
        let car = car_with(vec![(d(2024, 1, 15), d(2024, 1, 20), ReservationStatus::Confirmed)]);
        let overlapping = DateSpan::new(d(2024, 1, 18), d(2024, 1, 22));
        let adjacent = DateSpan::new(d(2024, 1, 20), d(2024, 1, 25));
        assert!(matches!(
            check_no_conflict(&car, &overlapping),
            Err(EngineError::ResourceUnavailable { .. })
        ));
        assert!(check_no_conflict(&car, &adjacent).is_ok());
    }

    #[test]
    fn cancelled_reservation_does_not_block() {
        let car = car_with(vec![(d(2024, 1, 10), d(2024, 1, 20), ReservationStatus::Cancelled)]);
        let span = DateSpan::new(d(2024, 1, 12), d(2024, 1, 14));
        assert!(check_no_conflict(&car, &span).is_ok());
    }

    #[test]
    fn transition_permissions() {
        let car = car_with(vec![
            (d(2024, 1, 1), d(2024, 1, 2), ReservationStatus::Pending),
            (d(2024, 2, 1), d(2024, 2, 2), ReservationStatus::Confirmed),
        ]);
        let pending = &car.reservations[0];
        let confirmed = &car.reservations[1];
        let renter = Actor::user("renter");
        let owner = Actor::user("owner");
        let stranger = Actor::user("stranger");
        let admin = Actor::admin("root");

        assert!(authorize_transition(&car, pending, &owner, ReservationStatus::Confirmed).is_ok());
        assert!(authorize_transition(&car, pending, &admin, ReservationStatus::Confirmed).is_ok());
        assert!(matches!(
            authorize_transition(&car, pending, &renter, ReservationStatus::Confirmed),
            Err(EngineError::NotPermitted(_))
        ));

        assert!(authorize_transition(&car, pending, &renter, ReservationStatus::Cancelled).is_ok());
        assert!(matches!(
            authorize_transition(&car, pending, &stranger, ReservationStatus::Cancelled),
            Err(EngineError::NotPermitted(_))
        ));

        assert!(authorize_transition(&car, confirmed, &owner, ReservationStatus::Cancelled).is_ok());
        assert!(matches!(
            authorize_transition(&car, confirmed, &renter, ReservationStatus::Cancelled),
            Err(EngineError::NotPermitted(_))
        ));
        assert!(matches!(
            authorize_transition(&car, confirmed, &owner, ReservationStatus::Pending),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn rental_total_multiplies_days() {
        let car = car_with(vec![]);
        let span = DateSpan::new(d(2024, 1, 15), d(2024, 1, 20));
        assert_eq!(rental_total(&car, &span), Some(22_500));

        let unpriced = CarState::new(Ulid::new(), "owner".into(), None, None);
        assert_eq!(rental_total(&unpriced, &span), None);
    }
}
