// Copyright (c) 2024-2025 Federico G. Schwindt <fgsch@lodoss.net>
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use chrono::{Datelike, Local};
use clap::{
    error::{Error, ErrorKind},
    Parser,
};
use std::str::FromStr as _;
use std::{path::PathBuf, time::Duration};
use thiserror::Error as ThisError;
use tracing::Level;

use crate::collector::{CollectorConfig, RunMode};
use crate::gaps::{self, GapError};
use crate::series::SeriesKind;

/// Startup failures. All of these abort the run before any fetch begins.
#[derive(ThisError, Debug)]
pub enum ConfigError {
    #[error("--skip-existing and --force-update are mutually exclusive")]
    ConflictingModes,
    #[error("--start-year {start} is after --end-year {end}")]
    InvalidYearRange { start: i32, end: i32 },
    #[error("invalid --target-periods for {series}: {source}")]
    InvalidTargetPeriod {
        series: &'static str,
        #[source]
        source: GapError,
    },
    #[error("invalid --log-level {value:?}: expected error, warn, info, debug or trace")]
    InvalidLogLevel { value: String },
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[from] reqwest::Error),
    #[error("Failed to create output directory: {0}")]
    CreateDirectory(#[from] std::io::Error),
}

#[derive(Parser, Debug, Clone)]
#[command(
    version,
    about,
    long_about = "Collect weekly and monthly surveillance datasets from the Tokyo \
                  epidemic reporting system, storing each period exactly once"
)]
pub struct Args {
    /// Series to collect (default: all)
    #[arg(long = "data-types", value_enum, value_delimiter = ',')]
    pub data_types: Vec<SeriesKind>,

    /// First year of the collection range
    #[arg(long, default_value_t = 2000)]
    pub start_year: i32,

    /// Last year of the collection range (default: current year)
    #[arg(long)]
    pub end_year: Option<i32>,

    /// Restrict collection to these period indices
    #[arg(long = "target-periods", value_delimiter = ',')]
    pub target_periods: Option<Vec<u32>>,

    /// Collect only periods that have no stored artifact (the default mode)
    #[arg(long, default_value_t = false)]
    pub skip_existing: bool,

    /// Re-fetch every valid period, overwriting stored artifacts
    #[arg(long, default_value_t = false)]
    pub force_update: bool,

    /// Fetch without saving or committing anything
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Skip the end-of-run commit
    #[arg(long, default_value_t = false)]
    pub no_commit: bool,

    /// Directory for storing collected datasets
    #[arg(long, short, default_value = "data/raw")]
    pub output_directory: PathBuf,

    /// Number of periods per batch between time-budget checks
    #[arg(long, default_value_t = 50, value_parser = parse_greater_than_zero)]
    pub batch_size: usize,

    /// Wall-clock budget for the whole run, in minutes
    #[arg(long, default_value_t = 330, value_parser = parse_greater_than_zero_u64)]
    pub max_runtime_minutes: u64,

    /// Number of retry attempts for failed requests
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Base delay for exponential backoff, in seconds
    #[arg(long, default_value = "1", value_parser = parse_duration_seconds)]
    pub base_delay: Duration,

    /// Backoff delay ceiling, in seconds
    #[arg(long, default_value = "60", value_parser = parse_duration_seconds)]
    pub max_delay: Duration,

    /// Minimum spacing between upstream requests, in seconds
    #[arg(long, default_value = "1.5", value_parser = parse_duration_seconds_f64)]
    pub rate_limit: Duration,

    /// Request timeout in seconds
    #[arg(long, default_value = "30", value_parser = parse_duration_seconds)]
    pub request_timeout: Duration,

    /// Delete artifacts older than this many days after the run
    #[arg(long)]
    pub cleanup_days: Option<u32>,

    /// User-Agent string for HTTP requests
    #[arg(long, short, default_value_t = concat!("epidata-collector/",
        env!("CARGO_PKG_VERSION_MAJOR"),
        ".",
        env!("CARGO_PKG_VERSION_MINOR")).to_string())]
    pub user_agent: String,

    /// Disable progress bar output
    #[arg(long, short, default_value_t = false)]
    pub quiet: bool,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn mode(&self) -> Result<RunMode, ConfigError> {
        match (self.skip_existing, self.force_update) {
            (true, true) => Err(ConfigError::ConflictingModes),
            (_, true) => Ok(RunMode::ForceUpdate),
            _ => Ok(RunMode::SkipExisting),
        }
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
            value: self.log_level.clone(),
        })
    }

    pub fn collector_config(&self) -> Result<CollectorConfig, ConfigError> {
        let mode = self.mode()?;

        let end_year = self.end_year.unwrap_or_else(|| Local::now().year());
        if self.start_year > end_year {
            return Err(ConfigError::InvalidYearRange {
                start: self.start_year,
                end: end_year,
            });
        }

        let series = if self.data_types.is_empty() {
            SeriesKind::ALL.to_vec()
        } else {
            self.data_types.clone()
        };

        if let Some(periods) = &self.target_periods {
            for &kind in &series {
                gaps::validate_include_list(kind.cadence(), periods).map_err(|source| {
                    ConfigError::InvalidTargetPeriod {
                        series: kind.name(),
                        source,
                    }
                })?;
            }
        }

        Ok(CollectorConfig {
            series,
            start_year: self.start_year,
            end_year,
            target_periods: self.target_periods.clone(),
            mode,
            dry_run: self.dry_run,
            batch_size: self.batch_size,
            max_runtime: Duration::from_secs(self.max_runtime_minutes * 60),
            show_progress: !self.quiet,
        })
    }
}

fn parse_greater_than_zero(s: &str) -> Result<usize, Error> {
    let v = s.parse().map_err(|_| {
        Error::raw(
            ErrorKind::InvalidValue,
            format!("`{s}` isn't a valid integer"),
        )
    })?;
    if v == 0 {
        Err(Error::raw(
            ErrorKind::InvalidValue,
            "Value must be greater than 0",
        ))
    } else {
        Ok(v)
    }
}

fn parse_greater_than_zero_u64(s: &str) -> Result<u64, Error> {
    parse_greater_than_zero(s).map(|v| v as u64)
}

fn parse_duration_seconds(s: &str) -> Result<Duration, Error> {
    let seconds = parse_greater_than_zero(s)?;
    Ok(Duration::from_secs(seconds as u64))
}

fn parse_duration_seconds_f64(s: &str) -> Result<Duration, Error> {
    let seconds: f64 = s.parse().map_err(|_| {
        Error::raw(
            ErrorKind::InvalidValue,
            format!("`{s}` isn't a valid number"),
        )
    })?;
    if seconds < 0.0 || !seconds.is_finite() {
        return Err(Error::raw(
            ErrorKind::InvalidValue,
            "Value must be a non-negative number",
        ));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Parses the command line, validates run configuration and builds the
/// upstream HTTP client.
pub fn parse_args() -> Result<(Args, CollectorConfig, reqwest::Client), ConfigError> {
    let args = Args::parse();
    args.log_level()?;
    let config = args.collector_config()?;

    let client = reqwest::Client::builder()
        .timeout(args.request_timeout)
        .user_agent(&args.user_agent)
        .build()?;

    std::fs::create_dir_all(&args.output_directory)?;

    Ok((args, config, client))
}
