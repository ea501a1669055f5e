use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

use crate::calendar::{self, Cadence, Period};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GapError {
    #[error("period {period} is out of range for a {cadence} series (valid range is 1..={max})")]
    PeriodOutOfRange {
        period: u32,
        cadence: Cadence,
        max: u32,
    },
}

/// Missing-period report for one series over a year range. Recomputed on
/// demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapReport {
    pub series_name: String,
    pub expected_count: usize,
    pub present_count: usize,
    pub missing: Vec<Period>,
}

/// Extracts (year, period) from an artifact file stem.
///
/// Canonical form: `{series}_{year}_{period}`. A deprecated legacy form
/// carries a `_{YYYYMMDD}_{HHMMSS}` timestamp suffix; it is recognized by
/// its trailing 8-digit and 6-digit fields so that year and period are read
/// from the same fixed positions in both forms. Returns None when the
/// fields do not parse as integers.
pub fn parse_year_period(stem: &str) -> Option<(i32, u32)> {
    let fields: Vec<&str> = stem.split('_').collect();
    let is_legacy = fields.len() >= 4
        && fields[fields.len() - 2].len() == 8
        && fields[fields.len() - 1].len() == 6
        && fields[fields.len() - 2].chars().all(|c| c.is_ascii_digit())
        && fields[fields.len() - 1].chars().all(|c| c.is_ascii_digit());
    let period_pos = if is_legacy {
        fields.len().checked_sub(3)?
    } else {
        fields.len().checked_sub(1)?
    };
    let year_pos = period_pos.checked_sub(1)?;

    let year_field = fields.get(year_pos)?;
    if year_field.len() != 4 {
        return None;
    }
    let year: i32 = year_field.parse().ok()?;
    let period: u32 = fields.get(period_pos)?.parse().ok()?;
    Some((year, period))
}

/// Periods already present for `series_name`, parsed from stored artifact
/// filenames. Files that do not belong to the series or do not parse are
/// skipped, not fatal.
pub fn existing_periods(series_name: &str, files: &[impl AsRef<Path>]) -> BTreeSet<Period> {
    let prefix = format!("{series_name}_");
    let mut present = BTreeSet::new();
    for file in files {
        let Some(stem) = file.as_ref().file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !stem.starts_with(&prefix) {
            continue;
        }
        if let Some((year, index)) = parse_year_period(stem) {
            present.insert(Period { year, index });
        }
    }
    present
}

/// Rejects explicit include-lists carrying indices no period of this
/// cadence can legally have. An out-of-range explicit request signals a
/// caller bug, not a legitimate gap.
pub fn validate_include_list(cadence: Cadence, include: &[u32]) -> Result<(), GapError> {
    let max = cadence.max_period();
    for &period in include {
        if period < 1 || period > max {
            return Err(GapError::PeriodOutOfRange {
                period,
                cadence,
                max,
            });
        }
    }
    Ok(())
}

/// Computes the periods that should exist per the calendar but have no
/// stored artifact, ascending by (year, period).
pub fn compute_gaps(
    series_name: &str,
    cadence: Cadence,
    years: std::ops::RangeInclusive<i32>,
    existing: &BTreeSet<Period>,
    include_only: Option<&[u32]>,
    today: NaiveDate,
) -> Result<GapReport, GapError> {
    if let Some(include) = include_only {
        validate_include_list(cadence, include)?;
    }

    let mut expected_count = 0;
    let mut present_count = 0;
    let mut missing = Vec::new();

    for year in years {
        for index in calendar::valid_periods(cadence, year, today) {
            if let Some(include) = include_only {
                if !include.contains(&index) {
                    continue;
                }
            }
            expected_count += 1;
            let period = Period { year, index };
            if existing.contains(&period) {
                present_count += 1;
            } else {
                missing.push(period);
            }
        }
    }

    Ok(GapReport {
        series_name: series_name.to_string(),
        expected_count,
        present_count,
        missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn periods(pairs: &[(i32, u32)]) -> BTreeSet<Period> {
        pairs
            .iter()
            .map(|&(year, index)| Period { year, index })
            .collect()
    }

    #[test]
    fn parse_canonical_filename() {
        assert_eq!(
            parse_year_period("sentinel_weekly_gender_2025_07"),
            Some((2025, 7))
        );
        assert_eq!(parse_year_period("notifiable_weekly_2024_52"), Some((2024, 52)));
    }

    #[test]
    fn parse_legacy_timestamped_filename() {
        assert_eq!(
            parse_year_period("sentinel_weekly_gender_2025_7_20250101_120000"),
            Some((2025, 7))
        );
    }

    #[test]
    fn parse_rejects_non_integer_fields() {
        assert_eq!(parse_year_period("sentinel_weekly_gender"), None);
        assert_eq!(parse_year_period("sentinel_weekly_gender_20xx_07"), None);
        assert_eq!(parse_year_period("notes"), None);
    }

    #[test]
    fn existing_periods_filters_by_series_prefix() {
        let files = vec![
            PathBuf::from("data/sentinel_weekly_gender_2024_01.csv"),
            PathBuf::from("data/sentinel_weekly_gender_2024_2_20240110_090000.csv"),
            PathBuf::from("data/sentinel_weekly_age_2024_03.csv"),
            PathBuf::from("data/README.md"),
        ];
        let present = existing_periods("sentinel_weekly_gender", &files);
        assert_eq!(present, periods(&[(2024, 1), (2024, 2)]));
    }

    #[test]
    fn gap_in_truncated_current_year() {
        // 2023-02-03 is a Friday in ISO week 5.
        let today = date(2023, 2, 3);
        let existing = periods(&[(2023, 1), (2023, 2), (2023, 4), (2023, 5)]);
        let report = compute_gaps(
            "sentinel_weekly_gender",
            Cadence::Weekly,
            2023..=2023,
            &existing,
            None,
            today,
        )
        .unwrap();
        assert_eq!(report.expected_count, 5);
        assert_eq!(report.present_count, 4);
        assert_eq!(report.missing, vec![Period { year: 2023, index: 3 }]);
    }

    #[test]
    fn gap_in_completed_52_week_year() {
        // Run from the following year so all 52 weeks of 2023 are expected.
        let today = date(2024, 6, 1);
        let existing = periods(&[(2023, 1), (2023, 2), (2023, 4), (2023, 5)]);
        let report = compute_gaps(
            "sentinel_weekly_gender",
            Cadence::Weekly,
            2023..=2023,
            &existing,
            None,
            today,
        )
        .unwrap();
        let mut want = vec![Period { year: 2023, index: 3 }];
        want.extend((6..=52).map(|index| Period { year: 2023, index }));
        assert_eq!(report.missing, want);
        assert_eq!(report.expected_count, 52);
    }

    #[test]
    fn gap_detection_covers_week_53() {
        let today = date(2021, 6, 1);
        let existing: BTreeSet<Period> = (1..=52).map(|index| Period { year: 2020, index }).collect();
        let report = compute_gaps(
            "sentinel_weekly_gender",
            Cadence::Weekly,
            2020..=2020,
            &existing,
            None,
            today,
        )
        .unwrap();
        assert_eq!(report.missing, vec![Period { year: 2020, index: 53 }]);
    }

    #[test]
    fn include_list_restricts_analysis() {
        let today = date(2024, 6, 1);
        let existing = periods(&[(2023, 10)]);
        let report = compute_gaps(
            "sentinel_monthly_gender",
            Cadence::Monthly,
            2023..=2023,
            &existing,
            Some(&[10, 11]),
            today,
        )
        .unwrap();
        assert_eq!(report.expected_count, 2);
        assert_eq!(report.present_count, 1);
        assert_eq!(report.missing, vec![Period { year: 2023, index: 11 }]);
    }

    #[test]
    fn out_of_range_include_list_is_rejected() {
        assert_eq!(
            validate_include_list(Cadence::Weekly, &[0, 54]),
            Err(GapError::PeriodOutOfRange {
                period: 0,
                cadence: Cadence::Weekly,
                max: 53,
            })
        );
        assert_eq!(
            validate_include_list(Cadence::Monthly, &[13]),
            Err(GapError::PeriodOutOfRange {
                period: 13,
                cadence: Cadence::Monthly,
                max: 12,
            })
        );
        assert!(validate_include_list(Cadence::Weekly, &[1, 53]).is_ok());
    }

    #[test]
    fn week_53_is_legal_in_include_list_even_for_52_week_years() {
        let today = date(2024, 6, 1);
        let report = compute_gaps(
            "sentinel_weekly_gender",
            Cadence::Weekly,
            2023..=2023,
            &BTreeSet::new(),
            Some(&[53]),
            today,
        )
        .unwrap();
        // 2023 only has 52 weeks, so nothing is expected.
        assert_eq!(report.expected_count, 0);
        assert!(report.missing.is_empty());
    }
}
