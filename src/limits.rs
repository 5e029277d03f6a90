//! Hard caps on engine inputs.

pub const MAX_CARS: usize = 100_000;
pub const MAX_RESERVATIONS_PER_CAR: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_USER_ID_LEN: usize = 128;

/// Longest single rental.
pub const MAX_RENTAL_DAYS: i64 = 366;

/// Widest window accepted by availability and calendar queries.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3 * 366;

/// Earliest and latest dates the engine accepts.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2200;

pub const MAX_DAILY_RATE_CENTS: u64 = 100_000_000;
