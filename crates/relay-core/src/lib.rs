//! Foundational low-level utilities shared across relay crates.
//!
//! Provides unix-millisecond time helpers used by lifecycle deadlines,
//! sweep windows, and audit timestamps.

pub mod time_utils;

pub use time_utils::{
    current_unix_timestamp, current_unix_timestamp_ms, minutes_to_ms, rounded_minutes_from_ms,
    start_of_utc_day_ms,
};
