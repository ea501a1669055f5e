use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_indicatif::span_ext::IndicatifSpanExt as _;

use crate::calendar::{self, Period};
use crate::fetch::FetchClient;
use crate::gaps;
use crate::series::SeriesKind;
use crate::store::Store;
use crate::vcs::{CommitOutcome, VersionControlPort};

const STATS_LOG_DIR: &str = "logs";
const REPORTED_ERROR_LIMIT: usize = 5;

/// How existing artifacts are treated. The two modes are mutually
/// exclusive; `args` rejects a run that requests both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Collect only periods with no stored artifact.
    SkipExisting,
    /// Re-fetch every valid period and overwrite what is stored.
    ForceUpdate,
}

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub series: Vec<SeriesKind>,
    pub start_year: i32,
    pub end_year: i32,
    pub target_periods: Option<Vec<u32>>,
    pub mode: RunMode,
    pub dry_run: bool,
    pub batch_size: usize,
    pub max_runtime: Duration,
    pub show_progress: bool,
}

/// Aggregate counters for one collection run.
#[derive(Debug, Default, Serialize)]
pub struct RunStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub errors: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct WorkItem {
    series: SeriesKind,
    period: Period,
}

/// Drives one run: gap analysis per series, sequential fetch of missing
/// periods in batches, storage, and a single end-of-run commit. Per-item
/// failures are accumulated, never raised past the batch loop.
pub struct Collector {
    config: CollectorConfig,
    client: FetchClient,
    store: Store,
    vcs: Box<dyn VersionControlPort>,
    token: CancellationToken,
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        client: FetchClient,
        store: Store,
        vcs: Box<dyn VersionControlPort>,
        token: CancellationToken,
    ) -> Self {
        Self {
            config,
            client,
            store,
            vcs,
            token,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn run(&self) -> RunStats {
        let mut stats = RunStats {
            started_at: Some(Utc::now()),
            ..RunStats::default()
        };
        let started = Instant::now();

        let work = self.plan(&mut stats).await;
        tracing::info!(
            "Planned {} periods across {} series",
            work.len(),
            self.config.series.len()
        );

        let span = tracing::info_span!("collect");
        span.pb_set_length(work.len() as u64);
        if self.config.show_progress {
            span.pb_start();
        }
        let _entered = span.enter();

        'batches: for batch in work.chunks(self.config.batch_size.max(1)) {
            for item in batch {
                if self.token.is_cancelled() {
                    tracing::warn!("Cancellation requested; stopping dispatch");
                    break 'batches;
                }
                self.process(item, &mut stats).await;
                span.pb_inc(1);
            }
            if started.elapsed() >= self.config.max_runtime {
                tracing::warn!(
                    "Run exceeded the {}s time budget; remaining periods are left \
                     for the next run",
                    self.config.max_runtime.as_secs()
                );
                break;
            }
        }
        drop(_entered);
        stats.finished_at = Some(Utc::now());

        if !self.config.dry_run {
            self.commit(&stats).await;
            self.write_stats_file(&stats).await;
        }

        self.log_summary(&stats);
        stats
    }

    /// Expands every configured series into the list of periods to fetch,
    /// ascending within each series. Planning failures (unreadable store
    /// listing, bad include-list) count as run errors but do not abort the
    /// other series.
    async fn plan(&self, stats: &mut RunStats) -> Vec<WorkItem> {
        let today = Local::now().date_naive();
        let mut work = Vec::new();

        for &series in &self.config.series {
            let missing = match self.config.mode {
                RunMode::ForceUpdate => {
                    if let Some(include) = &self.config.target_periods {
                        if let Err(err) = gaps::validate_include_list(series.cadence(), include) {
                            stats.errors.push(err.to_string());
                            tracing::error!("Skipping {series}: {err}");
                            continue;
                        }
                    }
                    let mut all = Vec::new();
                    for year in self.config.start_year..=self.config.end_year {
                        for index in calendar::valid_periods(series.cadence(), year, today) {
                            if let Some(include) = &self.config.target_periods {
                                if !include.contains(&index) {
                                    continue;
                                }
                            }
                            all.push(Period { year, index });
                        }
                    }
                    all
                }
                RunMode::SkipExisting => {
                    let files = match self.store.list_existing(Some(series.name()), None).await {
                        Ok(files) => files,
                        Err(err) => {
                            stats.errors.push(err.to_string());
                            tracing::error!("Skipping {series}: {err}");
                            continue;
                        }
                    };
                    let existing = gaps::existing_periods(series.name(), &files);
                    let report = match gaps::compute_gaps(
                        series.name(),
                        series.cadence(),
                        self.config.start_year..=self.config.end_year,
                        &existing,
                        self.config.target_periods.as_deref(),
                        today,
                    ) {
                        Ok(report) => report,
                        Err(err) => {
                            stats.errors.push(err.to_string());
                            tracing::error!("Skipping {series}: {err}");
                            continue;
                        }
                    };
                    tracing::info!(
                        "{series}: {} of {} periods present, {} missing",
                        report.present_count,
                        report.expected_count,
                        report.missing.len()
                    );
                    report.missing
                }
            };

            work.extend(missing.into_iter().map(|period| WorkItem { series, period }));
        }
        work
    }

    async fn process(&self, item: &WorkItem, stats: &mut RunStats) {
        stats.attempted += 1;
        let WorkItem { series, period } = item;

        let outcome = match self.client.fetch(*series, period.year, period.index).await {
            Ok(outcome) => outcome,
            Err(err) => {
                stats.failed += 1;
                stats.errors.push(err.to_string());
                tracing::error!("{err}");
                return;
            }
        };

        if self.config.dry_run {
            tracing::info!("[dry run] fetched {series} {period} ({} bytes)", outcome.data.len());
            stats.succeeded += 1;
            return;
        }

        let mut extra = serde_json::Map::new();
        extra.insert(
            "fetch_time_ms".to_string(),
            serde_json::Value::from(outcome.elapsed.as_millis() as u64),
        );
        extra.insert(
            "fetch_attempts".to_string(),
            serde_json::Value::from(outcome.attempts),
        );

        let force_overwrite = self.config.mode == RunMode::ForceUpdate;
        match self
            .store
            .save(
                series.name(),
                period.year,
                period.index,
                series.cadence(),
                &outcome.data,
                extra,
                force_overwrite,
            )
            .await
        {
            Ok(saved) if saved.duplicate => stats.duplicates += 1,
            Ok(_) => stats.succeeded += 1,
            Err(err) => {
                stats.failed += 1;
                stats.errors.push(err.to_string());
                tracing::error!("Failed to store {series} {period}: {err}");
            }
        }
    }

    async fn commit(&self, stats: &RunStats) {
        if stats.succeeded == 0 {
            return;
        }
        let message = format!(
            "Update surveillance data: {}",
            Local::now().format("%Y-%m-%d")
        );
        let staged = self
            .vcs
            .stage(&[self.store.base_dir().to_path_buf()])
            .await;
        let result = match staged {
            Ok(()) => self.vcs.commit(&message).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(CommitOutcome::Committed { hash }) => {
                tracing::info!("Committed collected data ({hash})");
            }
            Ok(CommitOutcome::NothingToCommit) => tracing::info!("Nothing to commit"),
            Ok(CommitOutcome::NoRepository) => {}
            Err(err) => tracing::warn!("Commit failed: {err}"),
        }
    }

    async fn write_stats_file(&self, stats: &RunStats) {
        let log_dir = self.store.base_dir().join(STATS_LOG_DIR);
        let path: PathBuf =
            log_dir.join(format!("stats_{}.json", Local::now().format("%Y%m%d_%H%M%S")));
        let result = async {
            tokio::fs::create_dir_all(&log_dir).await?;
            let encoded = serde_json::to_vec_pretty(stats)
                .map_err(|err| std::io::Error::other(err.to_string()))?;
            tokio::fs::write(&path, encoded).await
        }
        .await;
        if let Err(err) = result {
            tracing::warn!("Failed to write run stats to {}: {err}", path.display());
        }
    }

    fn log_summary(&self, stats: &RunStats) {
        tracing::info!("Run summary:");
        tracing::info!("  attempted:  {}", stats.attempted);
        tracing::info!("  succeeded:  {}", stats.succeeded);
        tracing::info!("  failed:     {}", stats.failed);
        tracing::info!("  duplicates: {}", stats.duplicates);
        for (i, error) in stats.errors.iter().take(REPORTED_ERROR_LIMIT).enumerate() {
            tracing::info!("  error {}: {error}", i + 1);
        }
        if stats.errors.len() > REPORTED_ERROR_LIMIT {
            tracing::info!(
                "  ({} further errors omitted)",
                stats.errors.len() - REPORTED_ERROR_LIMIT
            );
        }
    }
}
