mod availability;
mod clock;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{
    blocked_days, find_conflict, free_spans, has_conflict, list_overlapping, merge_overlapping,
    subtract_intervals,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::EngineError;
pub use store::{check_availability, ReservationStore};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedCarState = Arc<RwLock<CarState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedCarState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) clock: Arc<dyn Clock>,
    /// Reverse lookup: reservation id → car id
    pub(super) reservation_to_car: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared from before they take a car lock until
    /// their WAL append is acknowledged. Compaction holds it exclusively, so
    /// no append can land in a log that is about to be replaced.
    pub(super) compaction_gate: RwLock<()>,
}

/// Apply an event directly to a CarState. Caller holds the write lock.
fn apply_to_car(car: &mut CarState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationRequested {
            id,
            car_id,
            renter_id,
            span,
            total_price_cents,
        } => {
            car.insert_reservation(Reservation {
                id: *id,
                car_id: *car_id,
                renter_id: renter_id.clone(),
                span: *span,
                status: ReservationStatus::Pending,
                total_price_cents: *total_price_cents,
            });
            index.insert(*id, *car_id);
        }
        Event::ReservationConfirmed { id, .. } => {
            if let Some(r) = car.reservation_mut(*id) {
                r.status = ReservationStatus::Confirmed;
            }
        }
        Event::ReservationCancelled { id, .. } => {
            if let Some(r) = car.reservation_mut(*id) {
                r.status = ReservationStatus::Cancelled;
            }
        }
        Event::CarUpdated {
            name,
            daily_rate_cents,
            ..
        } => {
            car.name = name.clone();
            car.daily_rate_cents = *daily_rate_cents;
        }
        // CarListed/Delisted are handled at the DashMap level, not here
        Event::CarListed { .. } | Event::CarDelisted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            clock,
            reservation_to_car: DashMap::new(),
            compaction_gate: RwLock::new(()),
        };

        // Sole owner of these Arcs during replay, so try_read/try_write never contend.
        // blocking_read/blocking_write would panic inside the runtime.
        let contended = || io::Error::other("car state locked during replay");
        for event in &events {
            match event {
                Event::CarListed {
                    id,
                    owner_id,
                    name,
                    daily_rate_cents,
                } => {
                    let car = CarState::new(*id, owner_id.clone(), name.clone(), *daily_rate_cents);
                    engine.state.insert(*id, Arc::new(RwLock::new(car)));
                }
                Event::CarDelisted { id } => {
                    if let Some((_, car)) = engine.state.remove(id) {
                        let guard = car.try_read().map_err(|_| contended())?;
                        for r in &guard.reservations {
                            engine.reservation_to_car.remove(&r.id);
                        }
                    }
                }
                other => {
                    if let Some(car_id) = event_car_id(other)
                        && let Some(entry) = engine.state.get(&car_id)
                    {
                        let car = entry.clone();
                        let mut guard = car.try_write().map_err(|_| contended())?;
                        apply_to_car(&mut guard, other, &engine.reservation_to_car);
                    }
                }
            }
        }

        tracing::info!(
            "engine replayed {} events: {} cars, {} reservations",
            events.len(),
            engine.state.len(),
            engine.reservation_to_car.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_car(&self, id: &Ulid) -> Option<SharedCarState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_car_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_car
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// Today according to the injected clock.
    pub fn today(&self) -> chrono::NaiveDate {
        self.clock.today()
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(&self, car: &mut CarState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_car(car, event, &self.reservation_to_car);
        Ok(())
    }

    /// Lookup reservation → car, get car, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<CarState>, EngineError> {
        let car_id = self
            .get_car_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let car = self
            .get_car(&car_id)
            .ok_or(EngineError::ResourceNotFound(car_id))?;
        Ok(car.write_owned().await)
    }
}

/// Extract the car id from an event (for non-Listed/Delisted events).
fn event_car_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationRequested { car_id, .. }
        | Event::ReservationConfirmed { car_id, .. }
        | Event::ReservationCancelled { car_id, .. } => Some(*car_id),
        Event::CarUpdated { id, .. } => Some(*id),
        Event::CarListed { .. } | Event::CarDelisted { .. } => None,
    }
}
