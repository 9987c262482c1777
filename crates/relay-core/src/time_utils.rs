const MS_PER_MINUTE: u64 = 60_000;
const MS_PER_DAY: u64 = 86_400_000;

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Converts whole minutes to milliseconds.
pub const fn minutes_to_ms(minutes: u64) -> u64 {
    minutes * MS_PER_MINUTE
}

/// Rounds a millisecond duration to the nearest whole minute.
pub const fn rounded_minutes_from_ms(duration_ms: u64) -> u64 {
    (duration_ms + MS_PER_MINUTE / 2) / MS_PER_MINUTE
}

/// Returns the UTC midnight preceding `now_unix_ms`.
pub const fn start_of_utc_day_ms(now_unix_ms: u64) -> u64 {
    now_unix_ms - now_unix_ms % MS_PER_DAY
}
