//! Hard caps on input sizes and per-property collections.

pub const MAX_PROPERTIES: usize = 10_000;
pub const MAX_ROOMS_PER_PROPERTY: usize = 500;
pub const MAX_ADD_ONS_PER_PROPERTY: usize = 200;
pub const MAX_BOOKINGS_PER_PROPERTY: usize = 200_000;
pub const MAX_PRICING_RULES: usize = 10_000;
pub const MAX_FEEDS_PER_ROOM: usize = 8;
pub const MAX_FEATURES_PER_ROOM: usize = 64;

pub const MAX_ROOMS_PER_BOOKING: usize = 50;
pub const MAX_ADD_ONS_PER_BOOKING: usize = 50;
pub const MAX_STAY_NIGHTS: u32 = 365;
pub const MAX_GUESTS: u32 = 1_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 4_096;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_URL_LEN: usize = 2_048;
pub const MAX_CORRELATION_KEY_LEN: usize = 255;

/// Upper bound on a downloaded calendar feed.
pub const MAX_FEED_BYTES: usize = 4 * 1024 * 1024;
