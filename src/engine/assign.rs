use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::model::*;

use super::conflict::live_overlap;
use super::{Engine, EngineError};

impl Engine {
    /// First-fit auto-assignment: walk the lot's slots in creation order
    /// and return the first one free for the window, locked for writing
    /// so the caller can insert without the check going stale.
    ///
    /// Out-of-service slots never qualify. No randomization, no
    /// wear-leveling — the first free slot wins every time.
    pub(super) async fn first_fit(
        &self,
        lot_id: Ulid,
        span: &Span,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<SlotState>), EngineError> {
        let candidates = self
            .lot_slots
            .get(&lot_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(lot_id))?;

        for slot_id in candidates {
            let Some(slot) = self.slot(&slot_id) else {
                continue; // deleted between snapshot and lock
            };
            let guard = slot.write_owned().await;
            if guard.out_of_service {
                continue;
            }
            if live_overlap(&guard, span).is_none() {
                return Ok((slot_id, guard));
            }
        }
        Err(EngineError::NoSlotsAvailable(lot_id))
    }
}
