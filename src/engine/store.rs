use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

use super::availability::has_conflict;
use super::{Engine, EngineError};

/// Read side of reservation persistence, as seen by availability callers.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Pending and confirmed reservations of a car, ordered by start then id.
    async fn find_active_reservations(&self, car_id: Ulid) -> Result<Vec<Reservation>, EngineError>;
}

/// Whether `span` is free on the car according to `store`.
/// Read-only; does not reserve anything.
pub async fn check_availability<S>(store: &S, car_id: Ulid, span: &DateSpan) -> Result<bool, EngineError>
where
    S: ReservationStore + ?Sized,
{
    let active = store.find_active_reservations(car_id).await?;
    Ok(!has_conflict(&active, span))
}

#[async_trait]
impl ReservationStore for Engine {
    async fn find_active_reservations(&self, car_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let car = self
            .get_car(&car_id)
            .ok_or(EngineError::ResourceNotFound(car_id))?;
        let guard = car.read().await;
        Ok(guard.active().cloned().collect())
    }
}
