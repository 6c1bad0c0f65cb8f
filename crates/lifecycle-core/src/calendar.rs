//! Dense calendar spine.
//!
//! Rolling windows index into the spine by position, so a missing day would
//! silently shrink every window that spans it. The spine is therefore verified
//! gap-free before any aggregation uses it.

use std::ops::Range;

use chrono::NaiveDate;

use crate::error::{EngineError, Result};

/// A contiguous, ascending sequence of calendar days.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarSpine {
    days: Vec<NaiveDate>,
}

impl CalendarSpine {
    /// Generate every day in `start..=end`.
    pub fn generate(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(EngineError::Config(format!(
                "calendar horizon ends ({end}) before it starts ({start})"
            )));
        }
        let days: Vec<NaiveDate> = start.iter_days().take_while(|d| *d <= end).collect();
        Ok(Self { days })
    }

    /// Wrap an externally produced day list without checking it.
    ///
    /// Call [`CalendarSpine::ensure_covers`] before aggregating over it.
    pub fn from_days(mut days: Vec<NaiveDate>) -> Self {
        days.sort();
        days.dedup();
        Self { days }
    }

    pub fn days(&self) -> &[NaiveDate] {
        &self.days
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn start(&self) -> Option<NaiveDate> {
        self.days.first().copied()
    }

    pub fn end(&self) -> Option<NaiveDate> {
        self.days.last().copied()
    }

    /// Position of `date` in the spine.
    pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
        let start = self.start()?;
        let offset = (date - start).num_days();
        if offset < 0 {
            return None;
        }
        let idx = offset as usize;
        (self.days.get(idx) == Some(&date)).then_some(idx)
    }

    /// Index range of the trailing frame of `len` days ending at `idx`,
    /// clipped at the spine start.
    pub fn trailing(&self, idx: usize, len: usize) -> Range<usize> {
        let end = (idx + 1).min(self.days.len());
        let start = end.saturating_sub(len);
        start..end
    }

    /// Fail with [`EngineError::AggregationGap`] unless the spine is dense and
    /// covers `start..=end`.
    pub fn ensure_covers(&self, start: NaiveDate, end: NaiveDate) -> Result<()> {
        let (Some(first), Some(last)) = (self.start(), self.end()) else {
            return Err(EngineError::AggregationGap {
                missing: start,
                start,
                end,
            });
        };

        for pair in self.days.windows(2) {
            if let Some(expected) = pair[0].succ_opt() {
                if pair[1] != expected {
                    return Err(EngineError::AggregationGap {
                        missing: expected,
                        start: first,
                        end: last,
                    });
                }
            }
        }

        if start < first {
            return Err(EngineError::AggregationGap {
                missing: start,
                start: first,
                end: last,
            });
        }
        if end > last {
            return Err(EngineError::AggregationGap {
                missing: end,
                start: first,
                end: last,
            });
        }
        Ok(())
    }
}
