//! Recurring schedules and their date arithmetic.
//!
//! A `Schedule` is an immutable value: an interval (kind + parameters), the
//! direction used to roll non-banking days, and an anchor date. Identity is
//! interval + roll direction; the anchor does not take part in equality.

pub mod cadence;
pub mod calendar;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

pub use cadence::{Cadence, Interval, IntervalKind};

/// Raw dates can move this far when rolled past weekends and holidays.
const ROLL_SLACK_DAYS: i64 = 7;
/// Longest raw gap between two occurrences of any cadence, plus roll slack.
const SEARCH_SPAN_DAYS: i64 = 45;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollDirection {
    Forward,
    Backward,
}

impl RollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s.to_ascii_lowercase().as_str() {
            "forward" | "1" => Ok(Self::Forward),
            "backward" | "-1" => Ok(Self::Backward),
            other => Err(AppError::ValidationError(format!(
                "invalid roll direction '{}'",
                other
            ))),
        }
    }
}

/// Date range in which a real transaction may settle against one expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SettlementWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Smallest window covering both.
    pub fn union(&self, other: &SettlementWindow) -> SettlementWindow {
        SettlementWindow {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// How far around an expected date a settlement is accepted.
#[derive(Debug, Clone, Copy)]
pub struct SettlementPolicy {
    /// Banking days a deposit may land before its expected date.
    pub early_banking_days: i64,
    /// Calendar days of processing delay after the expected date.
    pub grace_days: i64,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            early_banking_days: 2,
            grace_days: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Schedule {
    interval: Interval,
    roll: RollDirection,
    anchor: NaiveDate,
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.interval == other.interval && self.roll == other.roll
    }
}

impl Eq for Schedule {}

impl Schedule {
    /// Build a schedule from its persisted parts. Invalid parameters fail here
    /// and nowhere else.
    pub fn new<S: AsRef<str>>(
        kind: IntervalKind,
        params: &[S],
        roll: RollDirection,
        anchor: NaiveDate,
    ) -> Result<Self, AppError> {
        let params: Vec<String> = params.iter().map(|p| p.as_ref().to_string()).collect();
        let interval = Interval::from_params(kind, &params)?;
        Ok(Self {
            interval,
            roll,
            anchor,
        })
    }

    /// Parse the text columns used by the repository.
    pub fn from_parts(
        interval: &str,
        params: &[String],
        roll: &str,
        anchor: NaiveDate,
    ) -> Result<Self, AppError> {
        Self::new(
            IntervalKind::parse(interval)?,
            params,
            RollDirection::parse(roll)?,
            anchor,
        )
    }

    pub fn kind(&self) -> IntervalKind {
        self.interval.kind()
    }

    pub fn params(&self) -> Vec<String> {
        self.interval.params()
    }

    pub fn roll_direction(&self) -> RollDirection {
        self.roll
    }

    pub fn anchor(&self) -> NaiveDate {
        self.anchor
    }

    pub fn lookback_days(&self) -> i64 {
        self.kind().lookback_days()
    }

    /// Ordered occurrence dates in `[start, end]` (or `(start, end)` when not
    /// inclusive), after rolling onto banking days.
    pub fn between(&self, start: NaiveDate, end: NaiveDate, inclusive: bool) -> Vec<NaiveDate> {
        if end < start {
            return Vec::new();
        }

        let in_range = |date: NaiveDate| {
            if inclusive {
                date >= start && date <= end
            } else {
                date > start && date < end
            }
        };

        let slack = Duration::days(ROLL_SLACK_DAYS);
        let stop = end + slack;
        let mut cursor = start - slack - Duration::days(1);
        let mut dates = Vec::new();

        loop {
            let raw = self.interval.next_raw(cursor, self.anchor);
            if raw > stop {
                break;
            }
            let rolled = calendar::roll(raw, self.roll);
            if in_range(rolled) {
                dates.push(rolled);
            }
            cursor = raw;
        }

        dates.sort();
        dates.dedup();
        dates
    }

    /// Most recent occurrence on or before `date` (strictly before when not
    /// inclusive).
    pub fn before(&self, date: NaiveDate, inclusive: bool) -> NaiveDate {
        let mut span = SEARCH_SPAN_DAYS;
        loop {
            let from = date - Duration::days(span);
            let found = self
                .between(from, date, true)
                .into_iter()
                .filter(|d| inclusive || *d < date)
                .last();
            if let Some(found) = found {
                return found;
            }
            span += SEARCH_SPAN_DAYS;
        }
    }

    /// Next occurrence strictly after `date`.
    pub fn after(&self, date: NaiveDate) -> NaiveDate {
        let mut span = SEARCH_SPAN_DAYS;
        loop {
            let to = date + Duration::days(span);
            if let Some(found) = self.between(date, to, true).into_iter().find(|d| *d > date) {
                return found;
            }
            span += SEARCH_SPAN_DAYS;
        }
    }

    /// Settlement window around an expected date: opens a few banking days
    /// early and closes after the grace period, on a banking day.
    pub fn window(&self, expected: NaiveDate, policy: &SettlementPolicy) -> SettlementWindow {
        let start = calendar::add_banking_days(expected, -policy.early_banking_days);
        let end = calendar::roll(
            expected + Duration::days(policy.grace_days),
            RollDirection::Forward,
        );
        SettlementWindow { start, end }
    }

    /// Same interval and roll direction, re-anchored.
    pub fn with_anchor(&self, anchor: NaiveDate) -> Self {
        Self {
            interval: self.interval.clone(),
            roll: self.roll,
            anchor,
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}] roll={} anchor={}",
            self.kind(),
            self.params().join(","),
            self.roll.as_str(),
            self.anchor
        )
    }
}
