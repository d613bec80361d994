use crate::model::Ms;

// Hard caps enforced at the mutation boundary. Requests past a cap get
// a LimitExceeded error rather than degrading the whole tenant.

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_LOTS_PER_TENANT: usize = 1_000;
pub const MAX_SLOTS_PER_LOT: usize = 10_000;
pub const MAX_BOOKINGS_PER_SLOT: usize = 100_000;
pub const MAX_WAITLIST_PER_LOT: usize = 10_000;
pub const MAX_RECURRENCES_PER_TENANT: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_SLOT_NUMBER_LEN: usize = 32;
pub const MAX_USER_LEN: usize = 128;

/// 2020-01-01T00:00:00Z — anything earlier is a malformed timestamp.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 1_577_836_800_000;
/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking may not span more than 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;

/// Availability queries are clamped to a 90-day window.
pub const MAX_QUERY_WINDOW_MS: Ms = 90 * 24 * 3_600_000;

/// Recurrence expansion never looks further ahead than this.
pub const MAX_HORIZON_DAYS: i64 = 90;
