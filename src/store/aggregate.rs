use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::ForecastRecord;

/// Merged, dampened and limited series across all sites.
///
/// Rebuilt from scratch on every change; never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateSeries {
    records: Vec<ForecastRecord>,
    /// Index of the last record starting before local midnight
    start_index: usize,
}

impl AggregateSeries {
    /// Wrap sorted records and place the start-of-today cursor.
    ///
    /// The cursor lands on the last record whose `period_start` is before
    /// `day_start`, so "today" queries can still see the interval that spans
    /// midnight. With no such record it stays at zero.
    pub fn new(records: Vec<ForecastRecord>, day_start: DateTime<Utc>) -> Self {
        debug_assert!(records
            .windows(2)
            .all(|w| w[0].period_start < w[1].period_start));
        let start_index = records
            .iter()
            .rposition(|r| r.period_start < day_start)
            .unwrap_or(0);
        Self {
            records,
            start_index,
        }
    }

    pub fn records(&self) -> &[ForecastRecord] {
        &self.records
    }

    pub fn start_index(&self) -> usize {
        self.start_index
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Move the cursor after midnight passes without a rebuild
    pub fn reanchor(&mut self, day_start: DateTime<Utc>) {
        self.start_index = self
            .records
            .iter()
            .rposition(|r| r.period_start < day_start)
            .unwrap_or(0);
    }

    /// Index range `[lo, hi)` of records intersecting `[start, end)`.
    ///
    /// Scans forward from the cursor, or from zero when `search_past` is set,
    /// and stops at the first record starting at or after `end`. When nothing
    /// intersects the result is an empty range.
    pub fn slice_bounds(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        search_past: bool,
    ) -> (usize, usize) {
        let origin = if search_past { 0 } else { self.start_index };
        let mut first = None;
        let mut hi = self.records.len();

        for (idx, record) in self.records.iter().enumerate().skip(origin) {
            if end <= record.period_start {
                hi = idx;
                break;
            }
            if first.is_none() && start < record.period_end() {
                first = Some(idx);
            }
        }

        match first {
            Some(lo) => (lo, hi),
            None => (origin, origin),
        }
    }

    /// Records intersecting `[start, end)`
    pub fn slice(&self, start: DateTime<Utc>, end: DateTime<Utc>, search_past: bool) -> &[ForecastRecord] {
        let (lo, hi) = self.slice_bounds(start, end, search_past);
        &self.records[lo..hi]
    }
}
