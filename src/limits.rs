//! Hard caps that keep a single hotel's engine bounded in memory and work.

/// Room types per hotel engine.
pub const MAX_ROOM_TYPES: usize = 1_000;

/// Units (`qty`) a single room type may expose.
pub const MAX_UNITS_PER_ROOM_TYPE: u32 = 10_000;

/// Units one reservation may request.
pub const MAX_UNITS_PER_RESERVATION: u32 = 500;

/// Claims (all statuses, history included) kept on one room type.
pub const MAX_CLAIMS_PER_ROOM_TYPE: usize = 1_000_000;

/// Longest bookable stay.
pub const MAX_STAY_NIGHTS: i64 = 366;

/// Widest availability / calendar query.
pub const MAX_QUERY_NIGHTS: i64 = 3 * 366;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ACTOR_LEN: usize = 256;
pub const MAX_ROOM_ID_LEN: usize = 64;

/// Hotels served by one registry.
pub const MAX_HOTELS: usize = 10_000;
pub const MAX_HOTEL_ID_LEN: usize = 128;

/// Dates outside this window are rejected as malformed input.
pub const MIN_VALID_YEAR: i32 = 1970;
pub const MAX_VALID_YEAR: i32 = 9999;
