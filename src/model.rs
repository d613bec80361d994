use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type inside the engine.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Open-interval overlap: touching endpoints do not conflict.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Calendar date as days since the unix epoch (UTC).
pub fn epoch_day(t: Ms) -> i64 {
    t.div_euclid(DAY_MS)
}

/// Weekday of an epoch day, Monday = 0 … Sunday = 6.
pub fn weekday_of_day(day: i64) -> u8 {
    // 1970-01-01 was a Thursday.
    ((day + 3).rem_euclid(7)) as u8
}

/// First instant of the day after `t` (UTC).
pub fn end_of_day(t: Ms) -> Ms {
    (epoch_day(t) + 1) * DAY_MS
}

/// Set of weekdays as a bitmask, bit 0 = Monday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekdaySet(pub u8);

impl WeekdaySet {
    pub fn from_days(days: &[u8]) -> Self {
        let mut mask = 0u8;
        for &d in days {
            if d < 7 {
                mask |= 1 << d;
            }
        }
        Self(mask)
    }

    pub fn contains(&self, day: u8) -> bool {
        day < 7 && self.0 & (1 << day) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 & 0x7f == 0
    }

    pub fn days(&self) -> Vec<u8> {
        (0..7).filter(|d| self.contains(*d)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    /// Reserved, holder not yet arrived.
    Confirmed,
    /// Holder checked in.
    Active,
    /// Terminal.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingKind {
    OneOff,
    /// Booked on behalf of a non-account guest; contact travels with the row.
    Guest { name: String, email: String },
    /// Materialized from a weekly recurrence rule.
    Recurring { rule: Ulid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    User,
    Admin,
    AutoRelease,
    Swap,
    SlotDeleted,
}

/// One row in the Booking Ledger. Cancelled bookings stay in the ledger
/// as terminal records; only live rows participate in conflict checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user: String,
    pub span: Span,
    pub status: BookingStatus,
    pub kind: BookingKind,
    pub checked_in_at: Option<Ms>,
    pub cancelled: Option<CancelReason>,
    /// Epoch day of `span.start` — the (user, slot, day) natural key
    /// that makes recurrence expansion idempotent.
    pub day: i64,
}

impl Booking {
    pub fn is_live(&self) -> bool {
        matches!(self.status, BookingStatus::Confirmed | BookingStatus::Active)
    }
}

/// One bookable parking space. Bookings are kept sorted by `span.start`
/// so overlap scans can binary-search past the query window.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub number: String,
    /// Manual override: an out-of-service slot never gets assigned,
    /// independent of what the ledger derives.
    pub out_of_service: bool,
    pub bookings: Vec<Booking>,
}

impl SlotState {
    pub fn new(id: Ulid, lot_id: Ulid, number: String) -> Self {
        Self {
            id,
            lot_id,
            number,
            out_of_service: false,
            bookings: Vec::new(),
        }
    }

    /// Insert keeping sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings whose span overlaps the query window, any status.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// A parking facility. Owns its slots (cascade delete) and the FIFO
/// waitlist of users wanting a space when the lot is full.
#[derive(Debug, Clone)]
pub struct LotState {
    pub id: Ulid,
    pub name: String,
    pub address: String,
    pub open: bool,
    pub waitlist: Vec<WaitlistEntry>,
}

impl LotState {
    pub fn new(id: Ulid, name: String, address: String) -> Self {
        Self {
            id,
            name,
            address,
            open: true,
            waitlist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub user: String,
    pub joined_at: Ms,
    /// None while still in line. Once stamped the entry is permanently
    /// past the front of the queue, booked or not.
    pub notified_at: Option<Ms>,
}

/// Weekly recurrence rule. Never booked directly; the expander
/// materializes concrete bookings from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub id: Ulid,
    pub user: String,
    pub lot_id: Ulid,
    pub slot_id: Ulid,
    pub weekdays: WeekdaySet,
    pub start_day: i64,
    /// None = open-ended.
    pub end_day: Option<i64>,
    pub start_minute: u16,
    pub end_minute: u16,
    pub active: bool,
}

impl Recurrence {
    /// Concrete booking window on a given calendar day (UTC).
    pub fn span_on(&self, day: i64) -> Span {
        Span::new(
            day * DAY_MS + self.start_minute as Ms * MINUTE_MS,
            day * DAY_MS + self.end_minute as Ms * MINUTE_MS,
        )
    }

    /// True if the rule can produce a booking on `day`.
    pub fn applies_on(&self, day: i64) -> bool {
        self.active
            && self.start_day <= day
            && self.end_day.is_none_or(|e| day <= e)
            && self.weekdays.contains(weekday_of_day(day))
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LotCreated {
        id: Ulid,
        name: String,
        address: String,
        open: bool,
    },
    LotUpdated {
        id: Ulid,
        name: String,
        address: String,
        open: bool,
    },
    LotDeleted {
        id: Ulid,
    },
    SlotCreated {
        id: Ulid,
        lot_id: Ulid,
        number: String,
        out_of_service: bool,
    },
    SlotUpdated {
        id: Ulid,
        lot_id: Ulid,
        out_of_service: bool,
    },
    SlotDeleted {
        id: Ulid,
        lot_id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        slot_id: Ulid,
        lot_id: Ulid,
        user: String,
        span: Span,
        kind: BookingKind,
    },
    BookingCheckedIn {
        id: Ulid,
        slot_id: Ulid,
        lot_id: Ulid,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        slot_id: Ulid,
        lot_id: Ulid,
        reason: CancelReason,
    },
    RecurrenceCreated {
        rule: Recurrence,
    },
    RecurrenceDeactivated {
        id: Ulid,
    },
    WaitlistJoined {
        id: Ulid,
        lot_id: Ulid,
        user: String,
        at: Ms,
    },
    WaitlistNotified {
        id: Ulid,
        lot_id: Ulid,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LotInfo {
    pub id: Ulid,
    pub name: String,
    pub address: String,
    pub open: bool,
    pub total_slots: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub number: String,
    pub out_of_service: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingInfo {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub lot_id: Ulid,
    pub user: String,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub kind: BookingKind,
    pub checked_in_at: Option<Ms>,
    pub cancelled: Option<CancelReason>,
}

impl BookingInfo {
    pub fn is_live(&self) -> bool {
        matches!(self.status, BookingStatus::Confirmed | BookingStatus::Active)
    }

    pub fn from_booking(b: &Booking, slot_id: Ulid, lot_id: Ulid) -> Self {
        Self {
            id: b.id,
            slot_id,
            lot_id,
            user: b.user.clone(),
            start: b.span.start,
            end: b.span.end,
            status: b.status,
            kind: b.kind.clone(),
            checked_in_at: b.checked_in_at,
            cancelled: b.cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitlistInfo {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub user: String,
    pub joined_at: Ms,
    pub notified_at: Option<Ms>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(1_700_000_000_000, 1_700_000_100_000);
        assert_eq!(s.duration_ms(), 100_000);
        assert!(s.contains_instant(1_700_000_000_000));
        assert!(!s.contains_instant(1_700_000_100_000)); // half-open
    }

    #[test]
    fn span_overlap_touching_is_free() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn weekday_math() {
        // 1970-01-01 (day 0) was a Thursday.
        assert_eq!(weekday_of_day(0), 3);
        // 2024-01-01 was a Monday: 19723 days after the epoch.
        assert_eq!(weekday_of_day(19_723), 0);
        assert_eq!(weekday_of_day(19_724), 1);
        assert_eq!(weekday_of_day(19_729), 6);
    }

    #[test]
    fn epoch_day_and_end_of_day() {
        let t = 19_723 * DAY_MS + 9 * 60 * MINUTE_MS; // 09:00 UTC
        assert_eq!(epoch_day(t), 19_723);
        assert_eq!(end_of_day(t), 19_724 * DAY_MS);
    }

    #[test]
    fn weekday_set_roundtrip() {
        let set = WeekdaySet::from_days(&[0, 2, 4]); // Mon/Wed/Fri
        assert!(set.contains(0));
        assert!(!set.contains(1));
        assert!(set.contains(4));
        assert!(!set.contains(6));
        assert_eq!(set.days(), vec![0, 2, 4]);
        assert!(WeekdaySet::from_days(&[]).is_empty());
        // Out-of-range days are ignored.
        assert!(WeekdaySet::from_days(&[7, 9]).is_empty());
    }

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            user: "u1".into(),
            span: Span::new(start, end),
            status,
            kind: BookingKind::OneOff,
            checked_in_at: None,
            cancelled: None,
            day: epoch_day(start),
        }
    }

    #[test]
    fn slot_bookings_stay_sorted() {
        let mut slot = SlotState::new(Ulid::new(), Ulid::new(), "A1".into());
        slot.insert_booking(booking(300, 400, BookingStatus::Confirmed));
        slot.insert_booking(booking(100, 200, BookingStatus::Confirmed));
        slot.insert_booking(booking(200, 300, BookingStatus::Confirmed));
        let starts: Vec<Ms> = slot.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_outside_window() {
        let mut slot = SlotState::new(Ulid::new(), Ulid::new(), "A1".into());
        slot.insert_booking(booking(100, 200, BookingStatus::Confirmed));
        slot.insert_booking(booking(450, 600, BookingStatus::Confirmed));
        slot.insert_booking(booking(1000, 1100, BookingStatus::Confirmed));

        let hits: Vec<_> = slot.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut slot = SlotState::new(Ulid::new(), Ulid::new(), "A1".into());
        slot.insert_booking(booking(100, 200, BookingStatus::Confirmed));
        assert_eq!(slot.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn cancelled_booking_is_not_live() {
        let mut b = booking(100, 200, BookingStatus::Confirmed);
        assert!(b.is_live());
        b.status = BookingStatus::Active;
        assert!(b.is_live());
        b.status = BookingStatus::Cancelled;
        assert!(!b.is_live());
    }

    #[test]
    fn recurrence_applies_on() {
        let monday = 19_723;
        let rule = Recurrence {
            id: Ulid::new(),
            user: "u1".into(),
            lot_id: Ulid::new(),
            slot_id: Ulid::new(),
            weekdays: WeekdaySet::from_days(&[0, 2, 4]),
            start_day: monday,
            end_day: Some(monday + 14),
            start_minute: 9 * 60,
            end_minute: 17 * 60,
            active: true,
        };
        assert!(rule.applies_on(monday)); // Monday
        assert!(!rule.applies_on(monday + 1)); // Tuesday
        assert!(rule.applies_on(monday + 2)); // Wednesday
        assert!(!rule.applies_on(monday - 7)); // before start
        assert!(!rule.applies_on(monday + 21)); // after end

        let mut inactive = rule.clone();
        inactive.active = false;
        assert!(!inactive.applies_on(monday));
    }

    #[test]
    fn recurrence_span_on() {
        let rule = Recurrence {
            id: Ulid::new(),
            user: "u1".into(),
            lot_id: Ulid::new(),
            slot_id: Ulid::new(),
            weekdays: WeekdaySet::from_days(&[0]),
            start_day: 0,
            end_day: None,
            start_minute: 9 * 60,
            end_minute: 17 * 60,
            active: true,
        };
        let span = rule.span_on(19_723);
        assert_eq!(span.start, 19_723 * DAY_MS + 9 * 60 * MINUTE_MS);
        assert_eq!(span.duration_ms(), 8 * 60 * MINUTE_MS);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            id: Ulid::new(),
            slot_id: Ulid::new(),
            lot_id: Ulid::new(),
            user: "u1".into(),
            span: Span::new(1_700_000_000_000, 1_700_003_600_000),
            kind: BookingKind::Guest {
                name: "Visitor".into(),
                email: "visitor@example.com".into(),
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
