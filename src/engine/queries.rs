use ulid::Ulid;

use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;

use super::conflict::live_overlap;
use super::{Engine, EngineError};

impl Engine {
    pub async fn list_lots(&self) -> Vec<LotInfo> {
        let arcs: Vec<_> = self.lots.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for lot in arcs {
            let guard = lot.read().await;
            out.push(LotInfo {
                id: guard.id,
                name: guard.name.clone(),
                address: guard.address.clone(),
                open: guard.open,
                total_slots: self.lot_slots.get(&guard.id).map_or(0, |e| e.len()),
            });
        }
        out.sort_by_key(|l| l.id);
        out
    }

    pub async fn get_lot(&self, id: &Ulid) -> Option<LotInfo> {
        let lot = self.lot(id)?;
        let guard = lot.read().await;
        Some(LotInfo {
            id: guard.id,
            name: guard.name.clone(),
            address: guard.address.clone(),
            open: guard.open,
            total_slots: self.lot_slots.get(id).map_or(0, |e| e.len()),
        })
    }

    pub async fn list_slots(&self, lot_id: &Ulid) -> Result<Vec<SlotInfo>, EngineError> {
        let slot_ids = self
            .lot_slots
            .get(lot_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*lot_id))?;
        let mut out = Vec::with_capacity(slot_ids.len());
        for slot_id in slot_ids {
            let Some(slot) = self.slot(&slot_id) else { continue };
            let guard = slot.read().await;
            out.push(SlotInfo {
                id: guard.id,
                lot_id: guard.lot_id,
                number: guard.number.clone(),
                out_of_service: guard.out_of_service,
            });
        }
        Ok(out)
    }

    pub async fn get_slot(&self, id: &Ulid) -> Option<SlotInfo> {
        let slot = self.slot(id)?;
        let guard = slot.read().await;
        Some(SlotInfo {
            id: guard.id,
            lot_id: guard.lot_id,
            number: guard.number.clone(),
            out_of_service: guard.out_of_service,
        })
    }

    pub async fn get_booking(&self, id: &Ulid) -> Option<BookingInfo> {
        let slot_id = self.slot_of_booking(id)?;
        let slot = self.slot(&slot_id)?;
        let guard = slot.read().await;
        guard
            .booking(id)
            .map(|b| BookingInfo::from_booking(b, slot_id, guard.lot_id))
    }

    /// All bookings of a lot, cancelled ones included, ordered by start.
    pub async fn list_bookings(&self, lot_id: &Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        let slot_ids = self
            .lot_slots
            .get(lot_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*lot_id))?;
        let mut out = Vec::new();
        for slot_id in slot_ids {
            let Some(slot) = self.slot(&slot_id) else { continue };
            let guard = slot.read().await;
            for b in &guard.bookings {
                out.push(BookingInfo::from_booking(b, slot_id, *lot_id));
            }
        }
        out.sort_by_key(|b| (b.start, b.id));
        Ok(out)
    }

    /// Slots of the lot free for the whole window. Availability is
    /// derived from the ledger on every call; out-of-service slots are
    /// never free.
    pub async fn free_slots(
        &self,
        lot_id: &Ulid,
        span: &Span,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        validate_span_for_query(span)?;
        let slot_ids = self
            .lot_slots
            .get(lot_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*lot_id))?;
        let mut out = Vec::new();
        for slot_id in slot_ids {
            let Some(slot) = self.slot(&slot_id) else { continue };
            let guard = slot.read().await;
            if guard.out_of_service {
                continue;
            }
            if live_overlap(&guard, span).is_none() {
                out.push(SlotInfo {
                    id: guard.id,
                    lot_id: guard.lot_id,
                    number: guard.number.clone(),
                    out_of_service: false,
                });
            }
        }
        Ok(out)
    }

    pub fn get_recurrence(&self, id: &Ulid) -> Option<Recurrence> {
        self.recurrences.get(id).map(|r| r.clone())
    }

    pub fn list_recurrences(&self) -> Vec<Recurrence> {
        let mut out: Vec<Recurrence> = self.recurrences.iter().map(|r| r.clone()).collect();
        out.sort_by_key(|r| r.id);
        out
    }

    /// Waitlist of a lot in FIFO (join) order.
    pub async fn list_waitlist(&self, lot_id: &Ulid) -> Result<Vec<WaitlistInfo>, EngineError> {
        let lot = self.lot(lot_id).ok_or(EngineError::NotFound(*lot_id))?;
        let guard = lot.read().await;
        Ok(guard
            .waitlist
            .iter()
            .map(|e| WaitlistInfo {
                id: e.id,
                lot_id: *lot_id,
                user: e.user.clone(),
                joined_at: e.joined_at,
                notified_at: e.notified_at,
            })
            .collect())
    }
}

/// Availability queries accept wider windows than bookings, but still
/// cap the scan.
fn validate_span_for_query(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidState("interval start must precede end"));
    }
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}
