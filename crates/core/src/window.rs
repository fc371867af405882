use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::WindowIndex;

pub const LABEL_FORMAT: &str = "%Y-%m-%d";

/// Fixed-width calendar windows counted from a start date.
///
/// Window `i` covers `(boundary(i - 1), boundary(i)]` with
/// `boundary(i) = start + (i + 1) * period`. Window 0 has no lower bound, so
/// records dated on or before `start` fall into it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowClock {
    start: NaiveDate,
    period_days: u32,
}

impl WindowClock {
    pub fn new(start: NaiveDate, period_days: u32) -> Self {
        Self {
            start,
            period_days: period_days.max(1),
        }
    }

    pub fn weekly(start: NaiveDate) -> Self {
        Self::new(start, 7)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn period_days(&self) -> u32 {
        self.period_days
    }

    /// Last date (inclusive) that belongs to `window`.
    pub fn boundary(&self, window: WindowIndex) -> NaiveDate {
        let days = i64::from(self.period_days) * (window as i64 + 1);
        self.start + Duration::days(days)
    }

    pub fn label(&self, window: WindowIndex) -> String {
        self.boundary(window).format(LABEL_FORMAT).to_string()
    }

    pub fn index_of(&self, date: NaiveDate) -> WindowIndex {
        let days = date.signed_duration_since(self.start).num_days();
        if days <= 0 {
            return 0;
        }
        ((days - 1) / i64::from(self.period_days)) as WindowIndex
    }

    pub fn contains(&self, window: WindowIndex, date: NaiveDate) -> bool {
        self.index_of(date) == window
    }

    /// Number of windows needed for the last boundary to reach `end`.
    pub fn windows_until(&self, end: NaiveDate) -> u64 {
        self.index_of(end) + 1
    }
}

/// First date strictly after `first` that falls on `anchor`.
pub fn aligned_start(first: NaiveDate, anchor: Weekday) -> NaiveDate {
    let mut days_ahead =
        i64::from(anchor.num_days_from_monday()) - i64::from(first.weekday().num_days_from_monday());
    if days_ahead <= 0 {
        days_ahead += 7;
    }
    first + Duration::days(days_ahead)
}
