use crate::model::Ms;

pub const MAX_LISTINGS: usize = 1_000_000;
pub const MAX_APARTMENTS: usize = 1_000_000;
/// Terminal bookings don't count; only open requests can crowd a listing.
pub const MAX_PENDING_VISITS_PER_LISTING: usize = 10_000;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_AREA_NAME_LEN: usize = 128;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_RENT: i64 = 1_000_000_000;
pub const MAX_OCCUPANCY: u32 = 1_000;
