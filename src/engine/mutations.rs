use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::ReleasePolicy;
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_free, has_user_booking_on_day, live_overlap, validate_span};
use super::{Engine, EngineError, SharedLot, WalCommand};

fn kind_label(kind: &BookingKind) -> &'static str {
    match kind {
        BookingKind::OneOff => "one_off",
        BookingKind::Guest { .. } => "guest",
        BookingKind::Recurring { .. } => "recurring",
    }
}

fn reason_label(reason: CancelReason) -> &'static str {
    match reason {
        CancelReason::User => "user",
        CancelReason::Admin => "admin",
        CancelReason::AutoRelease => "auto_release",
        CancelReason::Swap => "swap",
        CancelReason::SlotDeleted => "slot_deleted",
    }
}

impl Engine {
    // ── Lot / slot registry ──────────────────────────────────

    pub async fn create_lot(
        &self,
        id: Ulid,
        name: String,
        address: String,
    ) -> Result<(), EngineError> {
        if self.lots.len() >= MAX_LOTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many lots"));
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN || address.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("lot name or address out of range"));
        }
        if self.lots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::LotCreated {
            id,
            name,
            address,
            open: true,
        };
        self.wal_append(&event).await?;
        self.replay_event(&event);
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_lot(
        &self,
        id: Ulid,
        name: String,
        address: String,
        open: bool,
    ) -> Result<(), EngineError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || address.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("lot name or address out of range"));
        }
        let lot = self.lot(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = lot.write().await;
        let event = Event::LotUpdated {
            id,
            name,
            address,
            open,
        };
        self.persist_and_apply_lot(&mut guard, &event).await
    }

    /// Deleting a lot cascades into its slots and their bookings.
    /// Recurrence rules pointing at the lot stay behind; the expander
    /// skips them once their slot is gone.
    pub async fn delete_lot(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.lots.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::LotDeleted { id };
        self.wal_append(&event).await?;
        self.notify.send(id, &event);
        self.drop_lot_from_memory(&id);
        Ok(())
    }

    pub async fn create_slot(
        &self,
        id: Ulid,
        lot_id: Ulid,
        number: String,
    ) -> Result<(), EngineError> {
        if number.is_empty() || number.len() > MAX_SLOT_NUMBER_LEN {
            return Err(EngineError::LimitExceeded("slot number out of range"));
        }
        let lot = self.lot(&lot_id).ok_or(EngineError::NotFound(lot_id))?;
        // Held across the sibling scan and the insert; racing creates
        // with the same number serialize here.
        let _lot_guard = lot.write().await;
        if self.slots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let siblings = self
            .lot_slots
            .get(&lot_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        if siblings.len() >= MAX_SLOTS_PER_LOT {
            return Err(EngineError::LimitExceeded("too many slots in lot"));
        }
        for sibling_id in &siblings {
            if let Some(sibling) = self.slot(sibling_id) {
                let guard = sibling.read().await;
                if guard.number == number {
                    return Err(EngineError::DuplicateSlotNumber(number));
                }
            }
        }

        let event = Event::SlotCreated {
            id,
            lot_id,
            number,
            out_of_service: false,
        };
        self.wal_append(&event).await?;
        self.replay_event(&event);
        self.notify.send(lot_id, &event);
        Ok(())
    }

    /// Flip the manual out-of-service override. This is the only stored
    /// availability bit; everything else is derived from the ledger.
    pub async fn set_slot_service(
        &self,
        id: Ulid,
        out_of_service: bool,
    ) -> Result<(), EngineError> {
        let slot = self.slot(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = slot.write().await;
        let lot_id = guard.lot_id;
        let event = Event::SlotUpdated {
            id,
            lot_id,
            out_of_service,
        };
        self.persist_and_apply_slot(lot_id, &mut guard, &event).await
    }

    /// Deleting a slot cascades into its bookings.
    pub async fn delete_slot(&self, id: Ulid) -> Result<(), EngineError> {
        let slot = self.slot(&id).ok_or(EngineError::NotFound(id))?;
        let lot_id = slot.read().await.lot_id;
        let event = Event::SlotDeleted { id, lot_id };
        self.wal_append(&event).await?;
        self.notify.send(lot_id, &event);
        self.drop_slot_from_memory(&id, &lot_id);
        Ok(())
    }

    // ── Booking ledger ───────────────────────────────────────

    /// Create a booking. With `slot = None` the first free slot of the
    /// lot is assigned (first fit). Returns the slot actually booked.
    ///
    /// The conflict check runs under the slot's write guard, immediately
    /// before the insert — the check and the insert are one critical
    /// section, so two racing calls for the same window serialize and
    /// the loser gets `SlotUnavailable`.
    pub async fn create_booking(
        &self,
        id: Ulid,
        lot_id: Ulid,
        slot: Option<Ulid>,
        user: String,
        span: Span,
        kind: BookingKind,
    ) -> Result<Ulid, EngineError> {
        validate_span(&span)?;
        if user.is_empty() || user.len() > MAX_USER_LEN {
            return Err(EngineError::LimitExceeded("user id out of range"));
        }
        if self.booking_slot.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        {
            let lot = self.lot(&lot_id).ok_or(EngineError::NotFound(lot_id))?;
            if !lot.read().await.open {
                return Err(EngineError::LotClosed(lot_id));
            }
        }

        let (slot_id, mut guard) = match slot {
            Some(slot_id) => {
                let slot = self.slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
                let guard = slot.write_owned().await;
                if guard.lot_id != lot_id {
                    return Err(EngineError::WrongLot { slot: slot_id, lot: lot_id });
                }
                if guard.out_of_service {
                    return Err(EngineError::InvalidState("slot is out of service"));
                }
                check_free(&guard, &span)?;
                (slot_id, guard)
            }
            None => self.first_fit(lot_id, &span).await?,
        };

        if guard.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many bookings on slot"));
        }

        let event = Event::BookingCreated {
            id,
            slot_id,
            lot_id,
            user,
            span,
            kind: kind.clone(),
        };
        self.persist_and_apply_slot(lot_id, &mut guard, &event).await?;
        metrics::counter!(observability::BOOKINGS_TOTAL, "kind" => kind_label(&kind)).increment(1);
        Ok(slot_id)
    }

    /// Book the first free slot from `now` until the end of the (UTC)
    /// day — the "I just drove in" path.
    pub async fn quick_book(
        &self,
        id: Ulid,
        lot_id: Ulid,
        user: String,
        now: Ms,
    ) -> Result<Ulid, EngineError> {
        let span = Span::new(now, end_of_day(now));
        self.create_booking(id, lot_id, None, user, span, BookingKind::OneOff)
            .await
    }

    pub async fn check_in(&self, booking_id: Ulid, now: Ms) -> Result<(), EngineError> {
        let (slot_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let lot_id = guard.lot_id;
        let booking = guard
            .booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        match booking.status {
            BookingStatus::Cancelled => {
                return Err(EngineError::InvalidState("booking is cancelled"));
            }
            BookingStatus::Active => {
                return Err(EngineError::InvalidState("already checked in"));
            }
            BookingStatus::Confirmed => {}
        }
        let event = Event::BookingCheckedIn {
            id: booking_id,
            slot_id,
            lot_id,
            at: now,
        };
        self.persist_and_apply_slot(lot_id, &mut guard, &event).await
    }

    /// Cancel a booking. Returns false if it was already cancelled —
    /// cancelling twice is a harmless no-op, which is what lets the
    /// sweeper redo its work after a crash.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        reason: CancelReason,
    ) -> Result<bool, EngineError> {
        let (slot_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let lot_id = guard.lot_id;
        let booking = guard
            .booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if !booking.is_live() {
            return Ok(false);
        }
        let event = Event::BookingCancelled {
            id: booking_id,
            slot_id,
            lot_id,
            reason,
        };
        self.persist_and_apply_slot(lot_id, &mut guard, &event).await?;
        metrics::counter!(observability::CANCELLATIONS_TOTAL, "reason" => reason_label(reason))
            .increment(1);
        Ok(true)
    }

    /// Move a live booking to another slot of the same lot. The old row
    /// is cancelled with reason Swap and a fresh row is written on the
    /// target slot; returns the new booking id. Both slot locks are
    /// taken in sorted id order so concurrent swaps cannot deadlock.
    pub async fn swap_booking(
        &self,
        booking_id: Ulid,
        new_id: Ulid,
        target_slot: Ulid,
    ) -> Result<Ulid, EngineError> {
        let old_slot = self
            .slot_of_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if old_slot == target_slot {
            return Ok(booking_id);
        }
        if self.booking_slot.contains_key(&new_id) {
            return Err(EngineError::AlreadyExists(new_id));
        }

        let old_arc = self.slot(&old_slot).ok_or(EngineError::NotFound(old_slot))?;
        let new_arc = self
            .slot(&target_slot)
            .ok_or(EngineError::NotFound(target_slot))?;

        let (mut old_guard, mut new_guard) = if old_slot < target_slot {
            let a = old_arc.write_owned().await;
            let b = new_arc.write_owned().await;
            (a, b)
        } else {
            let b = new_arc.write_owned().await;
            let a = old_arc.write_owned().await;
            (a, b)
        };

        let lot_id = old_guard.lot_id;
        if new_guard.lot_id != lot_id {
            return Err(EngineError::WrongLot { slot: target_slot, lot: lot_id });
        }
        if new_guard.out_of_service {
            return Err(EngineError::InvalidState("target slot is out of service"));
        }
        let booking = old_guard
            .booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if !booking.is_live() {
            return Err(EngineError::InvalidState("booking is cancelled"));
        }
        let (user, span, kind) = (booking.user.clone(), booking.span, booking.kind.clone());
        check_free(&new_guard, &span)?;
        if new_guard.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many bookings on slot"));
        }

        // Create before cancel: a WAL failure between the two leaves a
        // duplicate hold, never a lost booking.
        let create = Event::BookingCreated {
            id: new_id,
            slot_id: target_slot,
            lot_id,
            user,
            span,
            kind,
        };
        self.persist_and_apply_slot(lot_id, &mut new_guard, &create).await?;

        let cancel = Event::BookingCancelled {
            id: booking_id,
            slot_id: old_slot,
            lot_id,
            reason: CancelReason::Swap,
        };
        self.persist_and_apply_slot(lot_id, &mut old_guard, &cancel).await?;
        Ok(new_id)
    }

    // ── Waitlist ─────────────────────────────────────────────

    pub async fn join_waitlist(
        &self,
        id: Ulid,
        lot_id: Ulid,
        user: String,
        now: Ms,
    ) -> Result<(), EngineError> {
        if user.is_empty() || user.len() > MAX_USER_LEN {
            return Err(EngineError::LimitExceeded("user id out of range"));
        }
        let lot = self.lot(&lot_id).ok_or(EngineError::NotFound(lot_id))?;
        let mut guard = lot.write().await;
        if guard.waitlist.len() >= MAX_WAITLIST_PER_LOT {
            return Err(EngineError::LimitExceeded("waitlist full"));
        }
        let event = Event::WaitlistJoined {
            id,
            lot_id,
            user,
            at: now,
        };
        self.persist_and_apply_lot(&mut guard, &event).await
    }

    /// Mark the next un-notified waitlist entry for the lot and emit a
    /// notice for downstream delivery. FIFO by join order. Entries are
    /// never re-queued: once notified they are past the front of the
    /// queue whether or not the user ever books.
    pub async fn notify_next(
        &self,
        lot_id: Ulid,
        now: Ms,
    ) -> Result<Option<WaitlistInfo>, EngineError> {
        let lot = self.lot(&lot_id).ok_or(EngineError::NotFound(lot_id))?;
        let mut guard = lot.write().await;
        let Some(entry) = guard
            .waitlist
            .iter()
            .find(|e| e.notified_at.is_none())
            .cloned()
        else {
            return Ok(None);
        };

        let event = Event::WaitlistNotified {
            id: entry.id,
            lot_id,
            at: now,
        };
        self.persist_and_apply_lot(&mut guard, &event).await?;

        self.notify.push_notice(crate::notify::Notice {
            lot_id,
            user: entry.user.clone(),
            message: format!("A space opened up at {}. Book now to claim it.", guard.name),
        });

        Ok(Some(WaitlistInfo {
            id: entry.id,
            lot_id,
            user: entry.user,
            joined_at: entry.joined_at,
            notified_at: Some(now),
        }))
    }

    // ── Recurrence rules ─────────────────────────────────────

    pub async fn create_recurrence(&self, rule: Recurrence) -> Result<(), EngineError> {
        if self.recurrences.len() >= MAX_RECURRENCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many recurrence rules"));
        }
        if rule.user.is_empty() || rule.user.len() > MAX_USER_LEN {
            return Err(EngineError::LimitExceeded("user id out of range"));
        }
        if rule.weekdays.is_empty() {
            return Err(EngineError::InvalidState("recurrence needs at least one weekday"));
        }
        if rule.start_minute >= rule.end_minute || rule.end_minute > 24 * 60 {
            return Err(EngineError::InvalidState("recurrence time window is malformed"));
        }
        if let Some(end) = rule.end_day
            && end < rule.start_day
        {
            return Err(EngineError::InvalidState("recurrence ends before it starts"));
        }
        if self.recurrences.contains_key(&rule.id) {
            return Err(EngineError::AlreadyExists(rule.id));
        }
        let slot = self
            .slot(&rule.slot_id)
            .ok_or(EngineError::NotFound(rule.slot_id))?;
        if slot.read().await.lot_id != rule.lot_id {
            return Err(EngineError::WrongLot { slot: rule.slot_id, lot: rule.lot_id });
        }

        let event = Event::RecurrenceCreated { rule: rule.clone() };
        self.wal_append(&event).await?;
        self.replay_event(&event);
        self.notify.send(rule.lot_id, &event);
        Ok(())
    }

    pub async fn deactivate_recurrence(&self, id: Ulid) -> Result<(), EngineError> {
        let lot_id = self
            .recurrences
            .get(&id)
            .map(|r| r.lot_id)
            .ok_or(EngineError::NotFound(id))?;
        let event = Event::RecurrenceDeactivated { id };
        self.wal_append(&event).await?;
        self.replay_event(&event);
        self.notify.send(lot_id, &event);
        Ok(())
    }

    // ── Auto-release sweep ───────────────────────────────────

    /// Cancel live bookings whose holder never checked in within the
    /// grace period, free their slot, and notify the lot's waitlist.
    ///
    /// Idempotent batch scan: eligibility is re-evaluated per booking on
    /// every run, and cancelling an already-cancelled booking is a no-op,
    /// so a crash mid-sweep just leaves work for the next tick.
    pub async fn sweep(&self, now: Ms, policy: &ReleasePolicy) -> usize {
        if !policy.is_active() {
            return 0;
        }
        let cutoff = now - policy.grace_ms();

        // Collect pass: cheap reads, skip contended slots — they get
        // another look next tick.
        let mut eligible: Vec<(Ulid, Ulid)> = Vec::new();
        for entry in self.slots.iter() {
            let slot = entry.value().clone();
            if let Ok(guard) = slot.try_read() {
                for b in &guard.bookings {
                    if b.is_live() && b.checked_in_at.is_none() && b.span.start <= cutoff {
                        eligible.push((b.id, guard.lot_id));
                    }
                }
            }
        }

        let mut released = 0usize;
        for (booking_id, lot_id) in eligible {
            // cancel_booking re-checks status under the write lock.
            match self.cancel_booking(booking_id, CancelReason::AutoRelease).await {
                Ok(true) => {
                    metrics::counter!(observability::AUTO_RELEASED_TOTAL).increment(1);
                    info!(
                        target: "audit",
                        actor = "system",
                        action = "booking.auto_release",
                        subject = %booking_id
                    );
                    released += 1;
                    if let Err(e) = self.notify_next(lot_id, now).await {
                        debug!("waitlist notify for lot {lot_id} failed: {e}");
                    }
                }
                Ok(false) => {}
                Err(e) => debug!("sweep skip {booking_id}: {e}"),
            }
        }
        released
    }

    // ── Recurrence expansion ─────────────────────────────────

    /// Materialize concrete bookings from active recurrence rules for
    /// the next `horizon_days` days (inclusive), skipping dates already
    /// booked by the rule's holder and dates where the slot is taken.
    ///
    /// Running this twice with unchanged state creates nothing the
    /// second time: the (user, slot, day) key is checked under the same
    /// write guard the insert uses.
    pub async fn expand(&self, now: Ms, horizon_days: i64) -> usize {
        let horizon = horizon_days.clamp(0, MAX_HORIZON_DAYS);
        let today = epoch_day(now);

        let rules: Vec<Recurrence> = self
            .recurrences
            .iter()
            .filter(|r| {
                r.active && r.start_day <= today && r.end_day.is_none_or(|e| e >= today)
            })
            .map(|r| r.clone())
            .collect();

        let mut created = 0usize;
        for rule in &rules {
            for offset in 0..=horizon {
                let day = today + offset;
                if !rule.applies_on(day) {
                    continue;
                }
                match self.expand_one(rule, day).await {
                    Ok(true) => created += 1,
                    Ok(false) => {}
                    Err(e) => {
                        // Per-item failures never abort the batch.
                        warn!("recurrence {} day {day}: {e}", rule.id);
                    }
                }
            }
        }
        created
    }

    async fn expand_one(&self, rule: &Recurrence, day: i64) -> Result<bool, EngineError> {
        let span = rule.span_on(day);
        validate_span(&span)?;

        let slot = self
            .slot(&rule.slot_id)
            .ok_or(EngineError::NotFound(rule.slot_id))?;
        let mut guard = slot.write_owned().await;

        if has_user_booking_on_day(&guard, &rule.user, day) {
            return Ok(false); // already materialized
        }
        if let Some(conflicting) = live_overlap(&guard, &span) {
            debug!(
                "recurrence {} day {day}: slot {} taken by {conflicting}",
                rule.id, rule.slot_id
            );
            return Ok(false);
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many bookings on slot"));
        }

        let id = Ulid::new();
        let event = Event::BookingCreated {
            id,
            slot_id: rule.slot_id,
            lot_id: rule.lot_id,
            user: rule.user.clone(),
            span,
            kind: BookingKind::Recurring { rule: rule.id },
        };
        let lot_id = rule.lot_id;
        self.persist_and_apply_slot(lot_id, &mut guard, &event).await?;
        metrics::counter!(observability::RECURRENCES_EXPANDED_TOTAL).increment(1);
        info!(
            target: "audit",
            actor = "system",
            action = "booking.expand",
            subject = %id
        );
        Ok(true)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with the minimal event sequence that recreates
    /// current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let lot_arcs: Vec<SharedLot> = self.lots.iter().map(|e| e.value().clone()).collect();
        for lot in lot_arcs {
            let guard = lot.read().await;
            events.push(Event::LotCreated {
                id: guard.id,
                name: guard.name.clone(),
                address: guard.address.clone(),
                open: guard.open,
            });
            for w in &guard.waitlist {
                events.push(Event::WaitlistJoined {
                    id: w.id,
                    lot_id: guard.id,
                    user: w.user.clone(),
                    at: w.joined_at,
                });
                if let Some(at) = w.notified_at {
                    events.push(Event::WaitlistNotified {
                        id: w.id,
                        lot_id: guard.id,
                        at,
                    });
                }
            }

            let slot_ids = self
                .lot_slots
                .get(&guard.id)
                .map(|e| e.value().clone())
                .unwrap_or_default();
            for slot_id in slot_ids {
                let Some(slot) = self.slot(&slot_id) else { continue };
                let slot_guard = slot.read().await;
                events.push(Event::SlotCreated {
                    id: slot_guard.id,
                    lot_id: guard.id,
                    number: slot_guard.number.clone(),
                    out_of_service: slot_guard.out_of_service,
                });
                for b in &slot_guard.bookings {
                    events.push(Event::BookingCreated {
                        id: b.id,
                        slot_id: slot_guard.id,
                        lot_id: guard.id,
                        user: b.user.clone(),
                        span: b.span,
                        kind: b.kind.clone(),
                    });
                    if let Some(at) = b.checked_in_at {
                        events.push(Event::BookingCheckedIn {
                            id: b.id,
                            slot_id: slot_guard.id,
                            lot_id: guard.id,
                            at,
                        });
                    }
                    if let Some(reason) = b.cancelled {
                        events.push(Event::BookingCancelled {
                            id: b.id,
                            slot_id: slot_guard.id,
                            lot_id: guard.id,
                            reason,
                        });
                    }
                }
            }
        }

        for rule in self.recurrences.iter() {
            events.push(Event::RecurrenceCreated { rule: rule.clone() });
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(WalCommand::Rewrite { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_rewrite(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceRewrite { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
