//! Per-kind occurrence rules. Each cadence yields raw (unrolled) dates; the
//! owning `Schedule` applies banking-day rolling.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

use super::calendar::{last_day_of_month, last_weekday, next_month, nth_weekday};

/// Interval kind, persisted as upper snake case text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntervalKind {
    Weekly,
    Biweekly,
    SemiMonthly,
    Monthly,
    WeekdayMonthly,
}

impl IntervalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weekly => "WEEKLY",
            Self::Biweekly => "BIWEEKLY",
            Self::SemiMonthly => "SEMI_MONTHLY",
            Self::Monthly => "MONTHLY",
            Self::WeekdayMonthly => "WEEKDAY_MONTHLY",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s.to_ascii_uppercase().as_str() {
            "WEEKLY" => Ok(Self::Weekly),
            "BIWEEKLY" => Ok(Self::Biweekly),
            "SEMI_MONTHLY" | "SEMIMONTHLY" => Ok(Self::SemiMonthly),
            "MONTHLY" => Ok(Self::Monthly),
            "WEEKDAY_MONTHLY" => Ok(Self::WeekdayMonthly),
            other => Err(AppError::ValidationError(format!(
                "unknown interval '{}'",
                other
            ))),
        }
    }

    /// Days one occurrence reaches back when deciding whether a series is
    /// still current.
    pub fn lookback_days(&self) -> i64 {
        match self {
            Self::Weekly => 7,
            Self::Biweekly | Self::SemiMonthly => 15,
            Self::Monthly | Self::WeekdayMonthly => 30,
        }
    }
}

impl std::fmt::Display for IntervalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Raw occurrence generation for one interval kind.
pub trait Cadence {
    /// First raw occurrence strictly after `date`. `anchor` fixes the phase of
    /// cadences that need one (biweekly).
    fn next_raw(&self, date: NaiveDate, anchor: NaiveDate) -> NaiveDate;

    fn kind(&self) -> IntervalKind;

    /// Kind-specific parameters in their persisted text form.
    fn params(&self) -> Vec<String>;
}

/// Day within a month; `Last` is written as `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DayOfMonth {
    Day(u32),
    Last,
}

impl DayOfMonth {
    fn parse(s: &str) -> Result<Self, AppError> {
        let value: i32 = s
            .trim()
            .parse()
            .map_err(|_| AppError::ValidationError(format!("invalid day of month '{}'", s)))?;
        match value {
            -1 => Ok(Self::Last),
            1..=31 => Ok(Self::Day(value as u32)),
            _ => Err(AppError::ValidationError(format!(
                "day of month out of range: {}",
                value
            ))),
        }
    }

    /// Resolve within a month, clamping days past the end to the last day.
    fn resolve(&self, year: i32, month: u32) -> Option<NaiveDate> {
        let last = last_day_of_month(year, month)?;
        match self {
            Self::Last => Some(last),
            Self::Day(day) => NaiveDate::from_ymd_opt(year, month, (*day).min(last.day())),
        }
    }

    fn sort_key(&self) -> u32 {
        match self {
            Self::Day(day) => *day,
            Self::Last => 32,
        }
    }

    fn to_param(self) -> String {
        match self {
            Self::Day(day) => day.to_string(),
            Self::Last => "-1".to_string(),
        }
    }
}

/// Week of the month for weekday-monthly schedules; `Last` is written as `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeekOrdinal {
    Nth(u8),
    Last,
}

impl WeekOrdinal {
    fn parse(s: &str) -> Result<Self, AppError> {
        match s.trim() {
            "-1" => Ok(Self::Last),
            "1" => Ok(Self::Nth(1)),
            "2" => Ok(Self::Nth(2)),
            "3" => Ok(Self::Nth(3)),
            "4" => Ok(Self::Nth(4)),
            other => Err(AppError::ValidationError(format!(
                "week ordinal must be 1-4 or -1, got '{}'",
                other
            ))),
        }
    }

    fn to_param(self) -> String {
        match self {
            Self::Nth(n) => n.to_string(),
            Self::Last => "-1".to_string(),
        }
    }
}

pub(crate) fn parse_weekday(s: &str) -> Result<Weekday, AppError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "monday" => Ok(Weekday::Mon),
        "tuesday" => Ok(Weekday::Tue),
        "wednesday" => Ok(Weekday::Wed),
        "thursday" => Ok(Weekday::Thu),
        "friday" => Ok(Weekday::Fri),
        "saturday" => Ok(Weekday::Sat),
        "sunday" => Ok(Weekday::Sun),
        other => Err(AppError::ValidationError(format!(
            "invalid weekday '{}'",
            other
        ))),
    }
}

pub(crate) fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// First date strictly after `date` falling on `weekday`.
fn next_weekday_after(date: NaiveDate, weekday: Weekday) -> NaiveDate {
    let current = i64::from(date.weekday().num_days_from_monday());
    let target = i64::from(weekday.num_days_from_monday());
    let mut ahead = (target - current).rem_euclid(7);
    if ahead == 0 {
        ahead = 7;
    }
    date + Duration::days(ahead)
}

fn expect_params<'a>(params: &'a [String], count: usize, kind: IntervalKind) -> Result<&'a [String], AppError> {
    if params.len() != count {
        return Err(AppError::ValidationError(format!(
            "{} expects {} parameter(s), got {}",
            kind,
            count,
            params.len()
        )));
    }
    Ok(params)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Weekly {
    pub weekday: Weekday,
}

impl Cadence for Weekly {
    fn next_raw(&self, date: NaiveDate, _anchor: NaiveDate) -> NaiveDate {
        next_weekday_after(date, self.weekday)
    }

    fn kind(&self) -> IntervalKind {
        IntervalKind::Weekly
    }

    fn params(&self) -> Vec<String> {
        vec![weekday_name(self.weekday).to_string()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Biweekly {
    pub weekday: Weekday,
}

impl Biweekly {
    /// The occurrence nearest to the anchor. Anchors are often observed
    /// (already rolled) dates, so they may sit a few days off the weekday.
    fn phase_origin(&self, anchor: NaiveDate) -> NaiveDate {
        let current = i64::from(anchor.weekday().num_days_from_monday());
        let target = i64::from(self.weekday.num_days_from_monday());
        let mut offset = (target - current).rem_euclid(7);
        if offset > 3 {
            offset -= 7;
        }
        anchor + Duration::days(offset)
    }
}

impl Cadence for Biweekly {
    fn next_raw(&self, date: NaiveDate, anchor: NaiveDate) -> NaiveDate {
        let origin = self.phase_origin(anchor);
        let candidate = next_weekday_after(date, self.weekday);
        if (candidate - origin).num_days().rem_euclid(14) == 0 {
            candidate
        } else {
            candidate + Duration::days(7)
        }
    }

    fn kind(&self) -> IntervalKind {
        IntervalKind::Biweekly
    }

    fn params(&self) -> Vec<String> {
        vec![weekday_name(self.weekday).to_string()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SemiMonthly {
    pub first: DayOfMonth,
    pub second: DayOfMonth,
}

impl Cadence for SemiMonthly {
    fn next_raw(&self, date: NaiveDate, _anchor: NaiveDate) -> NaiveDate {
        let (mut year, mut month) = (date.year(), date.month());
        loop {
            for day in [self.first, self.second] {
                if let Some(resolved) = day.resolve(year, month) {
                    if resolved > date {
                        return resolved;
                    }
                }
            }
            (year, month) = next_month(year, month);
        }
    }

    fn kind(&self) -> IntervalKind {
        IntervalKind::SemiMonthly
    }

    fn params(&self) -> Vec<String> {
        vec![self.first.to_param(), self.second.to_param()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Monthly {
    pub day: DayOfMonth,
}

impl Cadence for Monthly {
    fn next_raw(&self, date: NaiveDate, _anchor: NaiveDate) -> NaiveDate {
        let (mut year, mut month) = (date.year(), date.month());
        loop {
            if let Some(resolved) = self.day.resolve(year, month) {
                if resolved > date {
                    return resolved;
                }
            }
            (year, month) = next_month(year, month);
        }
    }

    fn kind(&self) -> IntervalKind {
        IntervalKind::Monthly
    }

    fn params(&self) -> Vec<String> {
        vec![self.day.to_param()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WeekdayMonthly {
    pub ordinal: WeekOrdinal,
    pub weekday: Weekday,
}

impl WeekdayMonthly {
    fn resolve(&self, year: i32, month: u32) -> Option<NaiveDate> {
        match self.ordinal {
            WeekOrdinal::Nth(n) => nth_weekday(year, month, self.weekday, n),
            WeekOrdinal::Last => last_weekday(year, month, self.weekday),
        }
    }
}

impl Cadence for WeekdayMonthly {
    fn next_raw(&self, date: NaiveDate, _anchor: NaiveDate) -> NaiveDate {
        let (mut year, mut month) = (date.year(), date.month());
        loop {
            if let Some(resolved) = self.resolve(year, month) {
                if resolved > date {
                    return resolved;
                }
            }
            (year, month) = next_month(year, month);
        }
    }

    fn kind(&self) -> IntervalKind {
        IntervalKind::WeekdayMonthly
    }

    fn params(&self) -> Vec<String> {
        vec![
            self.ordinal.to_param(),
            weekday_name(self.weekday).to_string(),
        ]
    }
}

/// Closed set of supported cadences.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Interval {
    Weekly(Weekly),
    Biweekly(Biweekly),
    SemiMonthly(SemiMonthly),
    Monthly(Monthly),
    WeekdayMonthly(WeekdayMonthly),
}

impl Interval {
    /// Build and validate an interval from its persisted form.
    pub fn from_params(kind: IntervalKind, params: &[String]) -> Result<Self, AppError> {
        match kind {
            IntervalKind::Weekly => {
                let p = expect_params(params, 1, kind)?;
                Ok(Self::Weekly(Weekly {
                    weekday: parse_weekday(&p[0])?,
                }))
            }
            IntervalKind::Biweekly => {
                let p = expect_params(params, 1, kind)?;
                Ok(Self::Biweekly(Biweekly {
                    weekday: parse_weekday(&p[0])?,
                }))
            }
            IntervalKind::SemiMonthly => {
                let p = expect_params(params, 2, kind)?;
                let first = DayOfMonth::parse(&p[0])?;
                let second = DayOfMonth::parse(&p[1])?;
                if first.sort_key() >= second.sort_key() {
                    return Err(AppError::ValidationError(format!(
                        "semi-monthly days must be ascending and distinct, got {:?}",
                        params
                    )));
                }
                Ok(Self::SemiMonthly(SemiMonthly { first, second }))
            }
            IntervalKind::Monthly => {
                let p = expect_params(params, 1, kind)?;
                Ok(Self::Monthly(Monthly {
                    day: DayOfMonth::parse(&p[0])?,
                }))
            }
            IntervalKind::WeekdayMonthly => {
                let p = expect_params(params, 2, kind)?;
                Ok(Self::WeekdayMonthly(WeekdayMonthly {
                    ordinal: WeekOrdinal::parse(&p[0])?,
                    weekday: parse_weekday(&p[1])?,
                }))
            }
        }
    }

    fn cadence(&self) -> &dyn Cadence {
        match self {
            Self::Weekly(c) => c,
            Self::Biweekly(c) => c,
            Self::SemiMonthly(c) => c,
            Self::Monthly(c) => c,
            Self::WeekdayMonthly(c) => c,
        }
    }
}

impl Cadence for Interval {
    fn next_raw(&self, date: NaiveDate, anchor: NaiveDate) -> NaiveDate {
        self.cadence().next_raw(date, anchor)
    }

    fn kind(&self) -> IntervalKind {
        self.cadence().kind()
    }

    fn params(&self) -> Vec<String> {
        self.cadence().params()
    }
}
