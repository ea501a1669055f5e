use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

/// Reporting cadence of a series.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Weekly,
    Monthly,
}

impl Cadence {
    pub fn label(&self) -> &'static str {
        match self {
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
        }
    }

    /// Largest period index a series of this cadence can ever carry.
    /// Weekly allows 53 because some ISO years have 53 weeks.
    pub fn max_period(&self) -> u32 {
        match self {
            Cadence::Weekly => 53,
            Cadence::Monthly => 12,
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One reporting period: an ISO week or a calendar month of a year.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub index: u32,
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:02}", self.year, self.index)
    }
}

/// Number of ISO weeks in `year`: 53 iff Dec 28 falls in week 53, else 52.
pub fn weeks_in_year(year: i32) -> u32 {
    // Dec 28 always lies in the last ISO week of its year.
    NaiveDate::from_ymd_opt(year, 12, 28)
        .map(|d| d.iso_week().week())
        .unwrap_or(52)
}

/// Period indices a series of `cadence` must have for `year`, truncated at
/// `today` for the current year. Empty for future years.
pub fn valid_periods(cadence: Cadence, year: i32, today: NaiveDate) -> RangeInclusive<u32> {
    match cadence {
        Cadence::Weekly => {
            let iso_year = today.iso_week().year();
            if year > iso_year {
                return 1..=0;
            }
            let mut last = weeks_in_year(year);
            if year == iso_year {
                last = last.min(today.iso_week().week());
            }
            1..=last
        }
        Cadence::Monthly => {
            if year > today.year() {
                return 1..=0;
            }
            let last = if year == today.year() { today.month() } else { 12 };
            1..=last
        }
    }
}

/// Calendar month containing ISO week `week` of `year`. Anchors on Jan 4,
/// which is guaranteed to be in week 1. Display/partitioning use only.
pub fn month_of_week(year: i32, week: u32) -> u32 {
    let Some(jan4) = NaiveDate::from_ymd_opt(year, 1, 4) else {
        return 1;
    };
    let week1_monday = jan4 - Duration::days(jan4.weekday().num_days_from_monday() as i64);
    let target = week1_monday + Duration::weeks(week as i64 - 1);
    target.month()
}
