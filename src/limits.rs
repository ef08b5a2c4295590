use crate::model::Ms;

/// Longest appointment the engine accepts. Also the look-back used when
/// searching for bookings that started before a requested interval.
pub const MAX_DURATION_MINUTES: u32 = 12 * 60;

/// Largest slot-grid step (one day).
pub const MAX_STEP_MINUTES: u32 = 24 * 60;

pub const MAX_BUFFER_MINUTES: u32 = 4 * 60;

pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_NAME_LEN: usize = 256;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

/// Instants must fall in [2000-01-01, 2100-01-01).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
