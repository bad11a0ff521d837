//! Input bounds. Anything past these is rejected with `EngineError::LimitExceeded`.

pub const MAX_ACTOR_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_PLATE_LEN: usize = 16;
pub const MAX_BOOKING_NOTES_LEN: usize = 1_000;
pub const MAX_ALLOCATION_NOTES_LEN: usize = 500;
pub const MAX_METHOD_LEN: usize = 50;
pub const MAX_CARD_NUMBER_LEN: usize = 19;

/// One week. Applies to both edit and payment windows.
pub const MAX_WINDOW_SECS: u32 = 7 * 24 * 60 * 60;

pub const MAX_JEEP_CAPACITY: u32 = 64;
