//! # Time Units and Affected Ranges
//!
//! Metric cells are bucketed by [`TimeUnit`]; a bucket is identified by the
//! date it starts on. Weeks start on Monday.
//!
//! Rollups never aggregate a partial bucket: before rolling up to a coarser
//! unit the affected range is widened to `[start_of(unit, from),
//! end_of(unit, to)]`.

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

/// Source → target unit pairs, in the order rollups run
pub const ROLLUP_LADDER: [(TimeUnit, TimeUnit); 4] = [
    (TimeUnit::Day, TimeUnit::Week),
    (TimeUnit::Day, TimeUnit::Month),
    (TimeUnit::Month, TimeUnit::Quarter),
    (TimeUnit::Quarter, TimeUnit::Year),
];

impl TimeUnit {
    pub const ALL: [TimeUnit; 5] = [
        TimeUnit::Day,
        TimeUnit::Week,
        TimeUnit::Month,
        TimeUnit::Quarter,
        TimeUnit::Year,
    ];

    pub fn abbreviation(&self) -> &'static str {
        match self {
            TimeUnit::Day => "d",
            TimeUnit::Week => "w",
            TimeUnit::Month => "m",
            TimeUnit::Quarter => "q",
            TimeUnit::Year => "y",
        }
    }

    /// Date-part name understood by PostgreSQL `date_trunc`
    pub fn date_part(&self) -> &'static str {
        match self {
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
            TimeUnit::Month => "month",
            TimeUnit::Quarter => "quarter",
            TimeUnit::Year => "year",
        }
    }

    /// First day of the bucket containing `date`
    pub fn start_of(&self, date: NaiveDate) -> NaiveDate {
        match self {
            TimeUnit::Day => date,
            TimeUnit::Week => {
                let back = i64::from(date.weekday().num_days_from_monday());
                date.checked_sub_signed(chrono::Duration::days(back))
                    .unwrap_or(NaiveDate::MIN)
            }
            TimeUnit::Month => date.with_day(1).unwrap_or(date),
            TimeUnit::Quarter => {
                let first_month = (date.month0() / 3) * 3 + 1;
                NaiveDate::from_ymd_opt(date.year(), first_month, 1).unwrap_or(date)
            }
            TimeUnit::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        }
    }

    /// Start of the bucket after the one containing `date`
    pub fn next_start(&self, date: NaiveDate) -> NaiveDate {
        let start = self.start_of(date);
        let next = match self {
            TimeUnit::Day => start.succ_opt(),
            TimeUnit::Week => start.checked_add_signed(chrono::Duration::days(7)),
            TimeUnit::Month => start.checked_add_months(Months::new(1)),
            TimeUnit::Quarter => start.checked_add_months(Months::new(3)),
            TimeUnit::Year => start.checked_add_months(Months::new(12)),
        };
        next.unwrap_or(NaiveDate::MAX)
    }

    /// Last day of the bucket containing `date`
    pub fn end_of(&self, date: NaiveDate) -> NaiveDate {
        let next = self.next_start(date);
        if next == NaiveDate::MAX {
            return NaiveDate::MAX;
        }
        next.pred_opt().unwrap_or(next)
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.date_part())
    }
}

impl std::str::FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "d" | "day" => Ok(TimeUnit::Day),
            "w" | "week" => Ok(TimeUnit::Week),
            "m" | "month" => Ok(TimeUnit::Month),
            "q" | "quarter" => Ok(TimeUnit::Quarter),
            "y" | "year" => Ok(TimeUnit::Year),
            _ => Err(format!("Invalid time unit: {s}")),
        }
    }
}

/// Inclusive date window touched by an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AffectedTimeRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl AffectedTimeRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self> {
        if from > to {
            return Err(PipelineError::validation(format!(
                "time range is invalid: {from} is after {to}"
            )));
        }
        Ok(Self { from, to })
    }

    pub fn single_day(date: NaiveDate) -> Self {
        Self { from: date, to: date }
    }

    /// Expand both ends to `unit` boundaries
    pub fn widen(&self, unit: TimeUnit) -> Self {
        Self {
            from: unit.start_of(self.from),
            to: unit.end_of(self.to),
        }
    }

    pub fn union(&self, other: &AffectedTimeRange) -> Self {
        Self {
            from: self.from.min(other.from),
            to: self.to.max(other.to),
        }
    }

    /// Smallest range covering every date, `None` when empty
    pub fn covering<I: IntoIterator<Item = NaiveDate>>(dates: I) -> Option<Self> {
        dates.into_iter().fold(None, |acc, date| {
            Some(match acc {
                None => Self::single_day(date),
                Some(range) => range.union(&Self::single_day(date)),
            })
        })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && date <= self.to
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.from.iter_days().take_while(move |d| *d <= self.to)
    }
}
