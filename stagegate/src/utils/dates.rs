//! Date-keyed work units.
//!
//! Work keys for daily pipelines are ISO dates (`YYYY-MM-DD`).

use crate::core::WorkKey;
use crate::errors::StagegateError;
use chrono::{Days, NaiveDate};

const WORK_DATE_FORMAT: &str = "%Y-%m-%d";

/// Formats `date` as a work key.
#[must_use]
pub fn work_key_for_date(date: NaiveDate) -> WorkKey {
    WorkKey::new(date.format(WORK_DATE_FORMAT).to_string())
}

/// Parses a date work key.
///
/// # Errors
///
/// Returns `StagegateError::PermanentData` if the key is not an ISO date.
pub fn parse_work_date(work_key: &WorkKey) -> Result<NaiveDate, StagegateError> {
    NaiveDate::parse_from_str(work_key.as_str(), WORK_DATE_FORMAT).map_err(|err| {
        StagegateError::PermanentData(format!("work key '{work_key}' is not a date: {err}"))
    })
}

/// Returns every date from `start` to `end`, both inclusive.
///
/// An inverted range yields nothing.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |day| *day <= end)
}

/// Returns the `days` dates ending at `today`, oldest first.
#[must_use]
pub fn trailing_window(today: NaiveDate, days: u32) -> (NaiveDate, NaiveDate) {
    let span = u64::from(days.saturating_sub(1));
    let start = today.checked_sub_days(Days::new(span)).unwrap_or(NaiveDate::MIN);
    (start, today)
}
