use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidState("interval start must precede end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("interval too wide"));
    }
    Ok(())
}

/// The central consistency rule of the ledger: does any live booking on
/// this slot overlap the window? Evaluated fresh against current state
/// on every decision — there is no cached occupancy map.
pub(crate) fn live_overlap(slot: &SlotState, span: &Span) -> Option<Ulid> {
    slot.overlapping(span)
        .find(|b| b.is_live())
        .map(|b| b.id)
}

/// Conflict check used by every write path. The caller holds the slot's
/// write guard across this check and the insert, so the check cannot be
/// invalidated by a concurrent writer.
pub(crate) fn check_free(slot: &SlotState, span: &Span) -> Result<(), EngineError> {
    match live_overlap(slot, span) {
        Some(conflicting) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::SlotUnavailable {
                slot: slot.id,
                conflicting,
            })
        }
        None => Ok(()),
    }
}

/// Recurrence idempotency key: does `user` already hold a non-cancelled
/// booking on this slot for this calendar day?
pub(crate) fn has_user_booking_on_day(slot: &SlotState, user: &str, day: i64) -> bool {
    slot.bookings
        .iter()
        .any(|b| b.day == day && b.user == user && b.is_live())
}
