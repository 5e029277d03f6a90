use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{blocked_days, free_spans, list_overlapping};
use super::conflict::{rental_total, validate_span, validate_window};
use super::store::check_availability;
use super::{Engine, EngineError, SharedCarState};

impl Engine {
    fn require_car(&self, car_id: Ulid) -> Result<SharedCarState, EngineError> {
        self.get_car(&car_id).ok_or(EngineError::ResourceNotFound(car_id))
    }

    /// All listed cars, ordered by id.
    pub async fn list_cars(&self) -> Vec<CarInfo> {
        let cars: Vec<SharedCarState> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(cars.len());
        for car in cars {
            let guard = car.read().await;
            infos.push(car_info(&guard));
        }
        infos.sort_by_key(|c| c.id);
        infos
    }

    pub async fn car_info(&self, car_id: Ulid) -> Result<CarInfo, EngineError> {
        let car = self.require_car(car_id)?;
        let guard = car.read().await;
        Ok(car_info(&guard))
    }

    pub async fn reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let car_id = self
            .get_car_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let car = self.require_car(car_id)?;
        let guard = car.read().await;
        guard.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Active reservations of a car overlapping the optional window,
    /// ordered by start then id. This is what calendar views render.
    pub async fn list_reservations(
        &self,
        car_id: Ulid,
        window_start: Option<NaiveDate>,
        window_end: Option<NaiveDate>,
    ) -> Result<Vec<Reservation>, EngineError> {
        if let (Some(start), Some(end)) = (window_start, window_end) {
            validate_window(&DateSpan { start, end })?;
        }
        let car = self.require_car(car_id)?;
        let guard = car.read().await;
        Ok(list_overlapping(guard.active(), window_start, window_end))
    }

    /// Every reservation ever made on the car, cancelled ones included.
    pub async fn reservation_history(&self, car_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let car = self.require_car(car_id)?;
        let guard = car.read().await;
        Ok(guard.reservations.clone())
    }

    /// Bookable sub-ranges of `window`.
    pub async fn free_spans(&self, car_id: Ulid, window: DateSpan) -> Result<Vec<DateSpan>, EngineError> {
        validate_window(&window)?;
        let car = self.require_car(car_id)?;
        let guard = car.read().await;
        Ok(free_spans(guard.active_overlapping(&window), &window))
    }

    /// Days inside `window` taken by an active reservation.
    pub async fn blocked_days(&self, car_id: Ulid, window: DateSpan) -> Result<Vec<NaiveDate>, EngineError> {
        validate_window(&window)?;
        let car = self.require_car(car_id)?;
        let guard = car.read().await;
        Ok(blocked_days(guard.active_overlapping(&window), &window))
    }

    /// Advisory availability check. The authoritative check is repeated under
    /// the write lock by `request_reservation`.
    pub async fn is_available(&self, car_id: Ulid, span: DateSpan) -> Result<bool, EngineError> {
        validate_span(&span)?;
        check_availability(self, car_id, &span).await
    }

    /// Default rental total for `span`: `days × daily_rate`.
    pub async fn quote_price(&self, car_id: Ulid, span: DateSpan) -> Result<Option<u64>, EngineError> {
        validate_span(&span)?;
        let car = self.require_car(car_id)?;
        let guard = car.read().await;
        Ok(rental_total(&guard, &span))
    }
}

fn car_info(car: &CarState) -> CarInfo {
    CarInfo {
        id: car.id,
        owner_id: car.owner_id.clone(),
        name: car.name.clone(),
        daily_rate_cents: car.daily_rate_cents,
        active_reservations: car.active_count(),
    }
}
