mod availability;
mod conflict;
mod error;
mod lifecycle;
mod pricing;
mod queries;
mod registry;
mod sweep;

pub use availability::day_sheet;
pub use conflict::{find_conflict, is_lapsed};
pub use error::EngineError;
pub use pricing::resolve_price;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};

use crate::clock::Clock;
use crate::model::*;
use crate::notify::{BookingNotice, NoticeAction, NotifyHub};
use crate::wal::Wal;

pub type SharedCourtState = Arc<RwLock<CourtState>>;

/// Default lifetime of a pending hold.
pub const HOLD_TTL_MS: Ms = 10 * 60_000;

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub hold_ttl_ms: Ms,
    /// Offset of venue wall-clock time from UTC. Booking dates and times are
    /// interpreted in this zone.
    pub utc_offset: FixedOffset,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hold_ttl_ms: HOLD_TTL_MS,
            utc_offset: Utc.fix(),
        }
    }
}

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
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
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
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The reservation engine: one lock per court, one WAL, one notify hub.
pub struct Engine {
    pub(super) courts: DashMap<CourtId, SharedCourtState>,
    /// Reverse lookup: booking id → court id
    pub(super) booking_index: DashMap<BookingId, CourtId>,
    /// Held by court creation, deletion and compaction. The set of courts
    /// cannot change while one of them runs.
    pub(super) registry: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: EngineSettings,
}

/// Apply an event directly to a CourtState. Caller holds the lock.
fn apply_to_court(cs: &mut CourtState, event: &Event, index: &DashMap<BookingId, CourtId>) {
    match event {
        Event::CourtUpdated { name, active, .. } => {
            cs.name = name.clone();
            cs.active = *active;
        }
        Event::ScheduleAdded { schedule } => {
            cs.schedules.push(schedule.clone());
            cs.schedules
                .sort_by_key(|s| (s.day_of_week, s.range.start, s.effective_from));
        }
        Event::ScheduleRemoved { id, .. } => {
            cs.schedules.retain(|s| s.id != *id);
        }
        Event::BookingPlaced { booking } => {
            index.insert(booking.id, cs.id);
            cs.insert_booking(booking.clone());
        }
        Event::BookingConfirmed { id, .. } => {
            if let Some(b) = cs.set_status(id, BookingStatus::Confirmed) {
                b.is_paid = true;
                b.pending_expires_at = None;
            }
        }
        Event::BookingCancelled { id, .. } | Event::HoldExpired { id, .. } => {
            if let Some(b) = cs.set_status(id, BookingStatus::Cancelled) {
                b.pending_expires_at = None;
            }
        }
        Event::BookingsCompleted { ids, .. } => {
            for id in ids {
                if let Some(b) = cs.set_status(id, BookingStatus::Completed) {
                    b.pending_expires_at = None;
                }
            }
        }
        Event::TransferListed { id, price, .. } => {
            if let Some(b) = cs.booking_mut(id) {
                b.is_for_transfer = true;
                b.transfer_status = Some(TransferStatus::Available);
                b.transfer_price = *price;
            }
        }
        Event::TransferPurchased { id, buyer, .. } => {
            if let Some(b) = cs.booking_mut(id) {
                b.holder = Holder::RegisteredUser(*buyer);
                b.transfer_status = Some(TransferStatus::Transferred);
            }
        }
        // CourtCreated/Deleted are handled at the DashMap level, not here
        Event::CourtCreated { .. } | Event::CourtDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            courts: DashMap::new(),
            booking_index: DashMap::new(),
            registry: Mutex::new(()),
            wal_tx,
            notify,
            clock,
            settings,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never block here: this may run inside an async context.
        for event in &events {
            match event {
                Event::CourtCreated { id, venue_id, name } => {
                    let cs = CourtState::new(*id, *venue_id, name.clone());
                    engine.courts.insert(*id, Arc::new(RwLock::new(cs)));
                }
                Event::CourtDeleted { id } => {
                    if let Some((_, rs)) = engine.courts.remove(id)
                        && let Ok(guard) = rs.try_read()
                    {
                        for b in guard.bookings() {
                            engine.booking_index.remove(&b.id);
                        }
                    }
                }
                other => {
                    if let Some(entry) = engine.courts.get(&other.court_id()) {
                        let rs = entry.value().clone();
                        drop(entry);
                        if let Ok(mut guard) = rs.try_write() {
                            apply_to_court(&mut guard, other, &engine.booking_index);
                        }
                    }
                }
            }
        }

        tracing::info!(
            "replayed {} events: {} courts, {} bookings",
            events.len(),
            engine.courts.len(),
            engine.booking_index.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    /// WAL-append then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        cs: &mut CourtState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_court(cs, event, &self.booking_index);
        Ok(())
    }

    pub fn get_court(&self, id: &CourtId) -> Option<SharedCourtState> {
        self.courts.get(id).map(|e| e.value().clone())
    }

    pub fn court_for_booking(&self, booking_id: &BookingId) -> Option<CourtId> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    /// Acquire the court's write lock. A handle that was retired between lookup
    /// and lock yields `StorageConflict`.
    pub(super) async fn lock_court(
        &self,
        court_id: &CourtId,
    ) -> Result<OwnedRwLockWriteGuard<CourtState>, EngineError> {
        let rs = self
            .get_court(court_id)
            .ok_or(EngineError::NotFound(*court_id))?;
        let guard = rs.write_owned().await;
        if guard.retired {
            return Err(EngineError::StorageConflict(*court_id));
        }
        Ok(guard)
    }

    /// Lookup booking → court, acquire the court's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &BookingId,
    ) -> Result<OwnedRwLockWriteGuard<CourtState>, EngineError> {
        let court_id = self
            .court_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        match self.lock_court(&court_id).await {
            Err(EngineError::StorageConflict(_)) => Err(EngineError::NotFound(*booking_id)),
            other => other,
        }
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Venue wall-clock time for `now`.
    pub fn local_now(&self) -> NaiveDateTime {
        DateTime::<Utc>::from_timestamp_millis(self.now())
            .unwrap_or_default()
            .with_timezone(&self.settings.utc_offset)
            .naive_local()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(super) fn publish(&self, booking: &Booking, action: NoticeAction) {
        self.notify.publish(&BookingNotice::new(booking, action));
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let registry = self.registry.lock().await;
        let mut events = Vec::new();
        let handles: Vec<SharedCourtState> = self.courts.iter().map(|e| e.value().clone()).collect();
        // The registry lock keeps courts from being added or removed, and the
        // read guards keep each court's own events out, until the swap.
        let mut guards = Vec::with_capacity(handles.len());
        for rs in handles {
            guards.push(rs.read_owned().await);
        }
        for guard in &guards {
            if guard.retired {
                continue;
            }
            events.push(Event::CourtCreated {
                id: guard.id,
                venue_id: guard.venue_id,
                name: guard.name.clone(),
            });
            if !guard.active {
                events.push(Event::CourtUpdated {
                    id: guard.id,
                    name: guard.name.clone(),
                    active: false,
                });
            }
            for schedule in &guard.schedules {
                events.push(Event::ScheduleAdded {
                    schedule: schedule.clone(),
                });
            }
            for booking in guard.bookings() {
                events.push(Event::BookingPlaced {
                    booking: booking.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        drop(registry);
        result
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
