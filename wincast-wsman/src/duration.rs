//! ISO-8601 durations as used in the `OperationTimeout` header.

use std::fmt::Write;
use std::time::Duration;

/// Format a duration as an ISO-8601 time span (`PT1H1M41S`).
pub fn iso8601(duration: Duration) -> String {
    iso8601_seconds(i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
}

/// Format a signed number of seconds. Anything not positive is `PT0S`.
pub fn iso8601_seconds(seconds: i64) -> String {
    if seconds <= 0 {
        return String::from("PT0S");
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let seconds = seconds % 60;

    let mut out = String::from("PT");
    if hours > 0 {
        let _ = write!(out, "{hours}H");
    }
    if minutes > 0 {
        let _ = write!(out, "{minutes}M");
    }
    if seconds > 0 {
        let _ = write!(out, "{seconds}S");
    }
    out
}
