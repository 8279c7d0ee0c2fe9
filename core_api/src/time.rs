use {chrono::Utc, std::time::Duration};

pub const FIVE_MINUTES: u64 = 5 * 60;
pub const ONE_HOUR: u64 = 60 * 60;
pub const ONE_DAY: u64 = 24 * ONE_HOUR;
pub const SEVEN_DAYS: u64 = 7 * ONE_DAY;
pub const THIRTY_DAYS: u64 = 30 * ONE_DAY;

/// Current unix time in seconds.
pub fn now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// Unix time `ttl` seconds from now.
pub fn expiry_from_now(ttl: u64) -> u64 {
    now().saturating_add(ttl)
}

pub fn is_expired(expiry: u64) -> bool {
    expiry <= now()
}

pub fn duration_until(expiry: u64) -> Duration {
    Duration::from_secs(expiry.saturating_sub(now()))
}
