use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::RESERVATION_REQUESTS_TOTAL;

use super::conflict::{
    authorize_car_admin, authorize_transition, check_no_conflict, check_not_owner, rental_total,
    validate_candidate,
};
use super::{Engine, EngineError, SharedCarState, WalCommand};

fn validate_car_fields(name: Option<&str>, daily_rate_cents: Option<u64>) -> Result<(), EngineError> {
    if name.is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("car name too long"));
    }
    if daily_rate_cents.is_some_and(|r| r > MAX_DAILY_RATE_CENTS) {
        return Err(EngineError::LimitExceeded("daily rate too high"));
    }
    Ok(())
}

fn validate_user(user: &str) -> Result<(), EngineError> {
    if user.is_empty() {
        return Err(EngineError::NotPermitted("anonymous actor"));
    }
    if user.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    Ok(())
}

impl Engine {
    pub async fn list_car(
        &self,
        id: Ulid,
        owner_id: UserId,
        name: Option<String>,
        daily_rate_cents: Option<u64>,
    ) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        if self.state.len() >= MAX_CARS {
            return Err(EngineError::LimitExceeded("too many cars"));
        }
        validate_user(&owner_id)?;
        validate_car_fields(name.as_deref(), daily_rate_cents)?;

        let event = Event::CarListed {
            id,
            owner_id: owner_id.clone(),
            name: name.clone(),
            daily_rate_cents,
        };
        // Claim the id with the car already write-locked, so nobody books it
        // before the listing is durable.
        let car: SharedCarState =
            Arc::new(RwLock::new(CarState::new(id, owner_id, name, daily_rate_cents)));
        let _guard = car.clone().write_owned().await;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(car);
            }
        }
        if let Err(e) = self.wal_append(&event).await {
            self.state.remove(&id);
            return Err(e);
        }
        info!("car {id} listed");
        Ok(())
    }

    /// Change a car's listing. `None` leaves a field as it is; `Some(None)`
    /// clears it.
    pub async fn update_car(
        &self,
        id: Ulid,
        actor: &Actor,
        name: Option<Option<String>>,
        daily_rate_cents: Option<Option<u64>>,
    ) -> Result<(), EngineError> {
        validate_car_fields(name.clone().flatten().as_deref(), daily_rate_cents.flatten())?;
        let _gate = self.compaction_gate.read().await;
        let car = self.get_car(&id).ok_or(EngineError::ResourceNotFound(id))?;
        let mut guard = car.write().await;
        authorize_car_admin(&guard, actor)?;

        let event = Event::CarUpdated {
            id,
            name: name.unwrap_or_else(|| guard.name.clone()),
            daily_rate_cents: daily_rate_cents.unwrap_or(guard.daily_rate_cents),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Remove a car from the marketplace. Refused while bookings are active.
    pub async fn delist_car(&self, id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let car = self.get_car(&id).ok_or(EngineError::ResourceNotFound(id))?;
        let guard = car.write().await;
        authorize_car_admin(&guard, actor)?;
        if guard.active_count() > 0 {
            return Err(EngineError::HasActiveReservations(id));
        }

        let event = Event::CarDelisted { id };
        self.wal_append(&event).await?;
        for r in &guard.reservations {
            self.reservation_to_car.remove(&r.id);
        }
        self.state.remove(&id);
        info!("car {id} delisted by {}", actor.user);
        Ok(())
    }

    /// Book `span` on a car for `actor`. The new reservation starts PENDING.
    ///
    /// Checks run in order: range, past start, car exists, self-booking,
    /// overlap. The overlap check and the WAL append happen under the car's
    /// write lock, so concurrent requests for one car cannot both succeed.
    /// Without an explicit total, `days × daily_rate` is used when known.
    pub async fn request_reservation(
        &self,
        id: Ulid,
        car_id: Ulid,
        actor: &Actor,
        span: DateSpan,
        total_price_cents: Option<u64>,
    ) -> Result<Reservation, EngineError> {
        let result = self
            .try_request_reservation(id, car_id, actor, span, total_price_cents)
            .await;
        let outcome = match &result {
            Ok(_) => "accepted",
            Err(e) => {
                debug!("reservation {id} on car {car_id} rejected: {e}");
                e.kind()
            }
        };
        metrics::counter!(RESERVATION_REQUESTS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn try_request_reservation(
        &self,
        id: Ulid,
        car_id: Ulid,
        actor: &Actor,
        span: DateSpan,
        total_price_cents: Option<u64>,
    ) -> Result<Reservation, EngineError> {
        validate_candidate(&span, self.today())?;
        validate_user(&actor.user)?;
        if self.reservation_to_car.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let _gate = self.compaction_gate.read().await;
        let car = self
            .get_car(&car_id)
            .ok_or(EngineError::ResourceNotFound(car_id))?;
        let mut guard = car.write().await;
        // Delisted while we waited for the lock.
        if !self.state.contains_key(&car_id) {
            return Err(EngineError::ResourceNotFound(car_id));
        }
        check_not_owner(&guard, actor)?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_CAR {
            return Err(EngineError::LimitExceeded("too many reservations on car"));
        }
        check_no_conflict(&guard, &span)?;

        // The early check above is not atomic; a request on another car may
        // have claimed the id since.
        match self.reservation_to_car.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(car_id);
            }
        }

        let total_price_cents = total_price_cents.or_else(|| rental_total(&guard, &span));
        let event = Event::ReservationRequested {
            id,
            car_id,
            renter_id: actor.user.clone(),
            span,
            total_price_cents,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.reservation_to_car.remove(&id);
            return Err(e);
        }
        info!("reservation {id} requested on car {car_id} for {span}");

        Ok(Reservation {
            id,
            car_id,
            renter_id: actor.user.clone(),
            span,
            status: ReservationStatus::Pending,
            total_price_cents,
        })
    }

    pub async fn confirm_reservation(&self, id: Ulid, actor: &Actor) -> Result<Reservation, EngineError> {
        self.transition(id, actor, ReservationStatus::Confirmed).await
    }

    pub async fn cancel_reservation(&self, id: Ulid, actor: &Actor) -> Result<Reservation, EngineError> {
        self.transition(id, actor, ReservationStatus::Cancelled).await
    }

    async fn transition(
        &self,
        id: Ulid,
        actor: &Actor,
        next: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard.reservation(id).cloned().ok_or(EngineError::NotFound(id))?;
        authorize_transition(&guard, &current, actor, next)?;

        let car_id = guard.id;
        let event = match next {
            ReservationStatus::Confirmed => Event::ReservationConfirmed { id, car_id },
            ReservationStatus::Cancelled => Event::ReservationCancelled { id, car_id },
            ReservationStatus::Pending => {
                return Err(EngineError::InvalidTransition {
                    from: current.status,
                    to: next,
                });
            }
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("reservation {id} {} -> {next} by {}", current.status, actor.user);

        Ok(Reservation {
            status: next,
            ..current
        })
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    /// Writers wait until the new log is in place.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let cars: Vec<SharedCarState> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();

        for car in cars {
            let guard = car.read().await;
            events.push(Event::CarListed {
                id: guard.id,
                owner_id: guard.owner_id.clone(),
                name: guard.name.clone(),
                daily_rate_cents: guard.daily_rate_cents,
            });
            for r in &guard.reservations {
                events.push(Event::ReservationRequested {
                    id: r.id,
                    car_id: guard.id,
                    renter_id: r.renter_id.clone(),
                    span: r.span,
                    total_price_cents: r.total_price_cents,
                });
                match r.status {
                    ReservationStatus::Pending => {}
                    ReservationStatus::Confirmed => events.push(Event::ReservationConfirmed {
                        id: r.id,
                        car_id: guard.id,
                    }),
                    ReservationStatus::Cancelled => events.push(Event::ReservationCancelled {
                        id: r.id,
                        car_id: guard.id,
                    }),
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
