mod assign;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::EngineError;
pub(crate) use conflict::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedLot = Arc<RwLock<LotState>>;
pub type SharedSlot = Arc<RwLock<SlotState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Rewrite {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceRewrite {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Rewrite { events, response } => {
            let result = Wal::write_rewrite_file(wal.path(), &events)
                .and_then(|()| wal.swap_rewrite_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceRewrite { response } => {
            let _ = response.send(wal.appends_since_rewrite());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One tenant's booking ledger: lots, slots, bookings, recurrence rules
/// and waitlists, all in memory, durably backed by the WAL.
pub struct Engine {
    pub(crate) lots: DashMap<Ulid, SharedLot>,
    pub(crate) slots: DashMap<Ulid, SharedSlot>,
    /// Slot ids per lot in creation order — also the first-fit order.
    pub(crate) lot_slots: DashMap<Ulid, Vec<Ulid>>,
    /// Reverse lookup: booking id → slot id.
    pub(crate) booking_slot: DashMap<Ulid, Ulid>,
    pub(crate) recurrences: DashMap<Ulid, Recurrence>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply a slot-scoped event (no locking — caller holds the write guard).
fn apply_slot_event(slot: &mut SlotState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingCreated {
            id,
            slot_id,
            user,
            span,
            kind,
            ..
        } => {
            slot.insert_booking(Booking {
                id: *id,
                user: user.clone(),
                span: *span,
                status: BookingStatus::Confirmed,
                kind: kind.clone(),
                checked_in_at: None,
                cancelled: None,
                day: epoch_day(span.start),
            });
            index.insert(*id, *slot_id);
        }
        Event::BookingCheckedIn { id, at, .. } => {
            if let Some(b) = slot.booking_mut(id) {
                b.checked_in_at = Some(*at);
                b.status = BookingStatus::Active;
            }
        }
        Event::BookingCancelled { id, reason, .. } => {
            if let Some(b) = slot.booking_mut(id) {
                b.status = BookingStatus::Cancelled;
                b.cancelled = Some(*reason);
            }
        }
        Event::SlotUpdated { out_of_service, .. } => {
            slot.out_of_service = *out_of_service;
        }
        _ => {}
    }
}

/// Apply a lot-scoped event (no locking — caller holds the write guard).
fn apply_lot_event(lot: &mut LotState, event: &Event) {
    match event {
        Event::LotUpdated {
            name,
            address,
            open,
            ..
        } => {
            lot.name = name.clone();
            lot.address = address.clone();
            lot.open = *open;
        }
        Event::WaitlistJoined { id, user, at, .. } => {
            lot.waitlist.push(WaitlistEntry {
                id: *id,
                user: user.clone(),
                joined_at: *at,
                notified_at: None,
            });
        }
        Event::WaitlistNotified { id, at, .. } => {
            if let Some(entry) = lot.waitlist.iter_mut().find(|e| e.id == *id) {
                entry.notified_at = Some(*at);
            }
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            lots: DashMap::new(),
            slots: DashMap::new(),
            lot_slots: DashMap::new(),
            booking_slot: DashMap::new(),
            recurrences: DashMap::new(),
            wal_tx,
            notify,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never block here: this may run inside an
        // async context (lazy tenant creation).
        for event in &events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::LotCreated {
                id,
                name,
                address,
                open,
            } => {
                let mut lot = LotState::new(*id, name.clone(), address.clone());
                lot.open = *open;
                self.lots.insert(*id, Arc::new(RwLock::new(lot)));
                self.lot_slots.entry(*id).or_default();
            }
            Event::LotDeleted { id } => {
                self.drop_lot_from_memory(id);
            }
            Event::SlotCreated {
                id,
                lot_id,
                number,
                out_of_service,
            } => {
                let mut slot = SlotState::new(*id, *lot_id, number.clone());
                slot.out_of_service = *out_of_service;
                self.slots.insert(*id, Arc::new(RwLock::new(slot)));
                self.lot_slots.entry(*lot_id).or_default().push(*id);
            }
            Event::SlotDeleted { id, lot_id } => {
                self.drop_slot_from_memory(id, lot_id);
            }
            Event::RecurrenceCreated { rule } => {
                self.recurrences.insert(rule.id, rule.clone());
            }
            Event::RecurrenceDeactivated { id } => {
                if let Some(mut rule) = self.recurrences.get_mut(id) {
                    rule.active = false;
                }
            }
            Event::LotUpdated { id, .. }
            | Event::WaitlistJoined { lot_id: id, .. }
            | Event::WaitlistNotified { lot_id: id, .. } => {
                if let Some(entry) = self.lots.get(id) {
                    let lot_arc = entry.clone();
                    let mut guard = lot_arc.try_write().expect("replay: uncontended write");
                    apply_lot_event(&mut guard, event);
                }
            }
            Event::SlotUpdated { id, .. }
            | Event::BookingCreated { slot_id: id, .. }
            | Event::BookingCheckedIn { slot_id: id, .. }
            | Event::BookingCancelled { slot_id: id, .. } => {
                if let Some(entry) = self.slots.get(id) {
                    let slot_arc = entry.clone();
                    let mut guard = slot_arc.try_write().expect("replay: uncontended write");
                    apply_slot_event(&mut guard, event, &self.booking_slot);
                }
            }
        }
    }

    /// Remove a slot and its booking index entries. Caller is responsible
    /// for having persisted the deletion. The index sweep avoids taking
    /// the slot lock — a concurrent request may still hold it.
    pub(super) fn drop_slot_from_memory(&self, id: &Ulid, lot_id: &Ulid) {
        if self.slots.remove(id).is_some() {
            self.booking_slot.retain(|_, slot| slot != id);
        }
        if let Some(mut ids) = self.lot_slots.get_mut(lot_id) {
            ids.retain(|s| s != id);
        }
    }

    pub(super) fn drop_lot_from_memory(&self, id: &Ulid) {
        if let Some((_, slot_ids)) = self.lot_slots.remove(id) {
            for slot_id in &slot_ids {
                self.slots.remove(slot_id);
            }
            self.booking_slot.retain(|_, slot| !slot_ids.contains(slot));
        }
        self.lots.remove(id);
        self.notify.remove(id);
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

    pub fn lot(&self, id: &Ulid) -> Option<SharedLot> {
        self.lots.get(id).map(|e| e.value().clone())
    }

    pub fn slot(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn slot_of_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_slot.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call, for slot-scoped events.
    pub(super) async fn persist_and_apply_slot(
        &self,
        lot_id: Ulid,
        slot: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_slot_event(slot, event, &self.booking_slot);
        self.notify.send(lot_id, event);
        Ok(())
    }

    /// WAL-append + apply + notify in one call, for lot-scoped events.
    pub(super) async fn persist_and_apply_lot(
        &self,
        lot: &mut LotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_lot_event(lot, event);
        self.notify.send(lot.id, event);
        Ok(())
    }

    /// Lookup booking → slot, acquire the slot's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<SlotState>), EngineError> {
        let slot_id = self
            .slot_of_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let slot = self
            .slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = slot.write_owned().await;
        Ok((slot_id, guard))
    }
}
