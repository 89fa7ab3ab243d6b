use crate::constants::BASE_DATE;
use chrono::{Duration, NaiveDateTime, NaiveTime};

/// Whole minutes from `from` to `to`, negative when `to` lies before `from`
///
/// Seconds are truncated; all delay arithmetic runs on whole minutes.
#[must_use]
pub fn minutes_between(from: NaiveDateTime, to: NaiveDateTime) -> i64 {
    to.signed_duration_since(from).num_minutes()
}

/// Shift a schedule time by a whole number of minutes
#[must_use]
pub fn add_minutes(time: NaiveDateTime, minutes: i64) -> NaiveDateTime {
    time + Duration::minutes(minutes)
}

/// Parse a feed time string in HH:MM:SS or HH:MM format onto `BASE_DATE`
///
/// # Errors
///
/// Returns an error if the string parses as neither format.
pub fn parse_feed_time(s: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map(|t| BASE_DATE.and_time(t))
}
