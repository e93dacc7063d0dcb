//! US banking-day calendar: weekends plus Federal Reserve holidays.

use chrono::{Datelike, Duration, NaiveDate, Weekday};

use super::RollDirection;

/// Whether ACH settles on `date`.
pub fn is_banking_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !is_federal_holiday(date)
}

/// Move `date` to the nearest banking day in `direction`. Banking days are
/// returned unchanged.
pub fn roll(date: NaiveDate, direction: RollDirection) -> NaiveDate {
    let step = match direction {
        RollDirection::Forward => Duration::days(1),
        RollDirection::Backward => Duration::days(-1),
    };
    let mut rolled = date;
    while !is_banking_day(rolled) {
        rolled += step;
    }
    rolled
}

/// Move `days` banking days away from `date` (negative moves backwards).
/// The starting day itself is never counted.
pub fn add_banking_days(date: NaiveDate, days: i64) -> NaiveDate {
    let step = if days < 0 {
        Duration::days(-1)
    } else {
        Duration::days(1)
    };
    let mut remaining = days.abs();
    let mut current = date;
    while remaining > 0 {
        current += step;
        if is_banking_day(current) {
            remaining -= 1;
        }
    }
    current
}

/// Federal Reserve holiday schedule, as observed. Holidays falling on a
/// Sunday are observed the following Monday; Saturday holidays are not
/// observed by the Fed.
pub fn is_federal_holiday(date: NaiveDate) -> bool {
    let year = date.year();
    observed_holidays(year).contains(&date)
}

fn observed_holidays(year: i32) -> Vec<NaiveDate> {
    let mut fixed = vec![(1, 1), (7, 4), (11, 11), (12, 25)];
    if year >= 2022 {
        fixed.push((6, 19));
    }

    let mut holidays: Vec<NaiveDate> = fixed
        .into_iter()
        .filter_map(|(month, day)| NaiveDate::from_ymd_opt(year, month, day))
        .filter_map(|d| match d.weekday() {
            Weekday::Sun => Some(d + Duration::days(1)),
            Weekday::Sat => None,
            _ => Some(d),
        })
        .collect();

    let floating = [
        nth_weekday(year, 1, Weekday::Mon, 3),  // Martin Luther King Jr.
        nth_weekday(year, 2, Weekday::Mon, 3),  // Presidents
        last_weekday(year, 5, Weekday::Mon),    // Memorial
        nth_weekday(year, 9, Weekday::Mon, 1),  // Labor
        nth_weekday(year, 10, Weekday::Mon, 2), // Columbus
        nth_weekday(year, 11, Weekday::Thu, 4), // Thanksgiving
    ];
    holidays.extend(floating.into_iter().flatten());
    holidays
}

pub(crate) fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

pub(crate) fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let last = last_day_of_month(year, month)?;
    let back = (7 + last.weekday().num_days_from_monday() - weekday.num_days_from_monday()) % 7;
    Some(last - Duration::days(i64::from(back)))
}

pub(crate) fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = next_month(year, month);
    NaiveDate::from_ymd_opt(next_year, next_month, 1).map(|d| d - Duration::days(1))
}

pub(crate) fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}
