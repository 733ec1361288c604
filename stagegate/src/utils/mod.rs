//! Small shared helpers.

pub mod dates;

pub use dates::{date_range, parse_work_date, trailing_window, work_key_for_date};
