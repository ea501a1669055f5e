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

mod args;
mod calendar;
mod collector;
mod fetch;
mod gaps;
mod index;
mod series;
mod store;
mod vcs;

use std::process::ExitCode;
use std::sync::Arc;

use indicatif::ProgressStyle;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    fmt::writer::MakeWriterExt as _, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

use args::Args;
use collector::{Collector, CollectorConfig, RunStats};
use fetch::{BackoffPolicy, FetchClient, HttpDataSource, RateLimiter, DEFAULT_BASE_URL};
use store::Store;
use vcs::{GitCli, NoopVcs, VersionControlPort};

#[tokio::main]
async fn main() -> ExitCode {
    let (args, config, client) = match args::parse_args() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let indicatif_layer = IndicatifLayer::new().with_progress_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{wide_bar}] {pos:>5}/{len:5} ({percent:>3}%) ETA: {eta}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );
    // Rejected by parse_args if not a valid level.
    let max_level = args.log_level().unwrap_or(Level::INFO);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(
                    indicatif_layer
                        .get_stderr_writer()
                        .with_max_level(max_level),
                )
                .with_target(false),
        )
        .with(indicatif_layer)
        .init();

    // Handle ctrl-c
    let token = CancellationToken::new();
    tokio::task::spawn({
        let token = token.clone();
        async move {
            _ = tokio::signal::ctrl_c().await;
            token.cancel();
        }
    });

    match run(&args, config, client, token).await {
        Ok(stats) if stats.failed == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    args: &Args,
    config: CollectorConfig,
    client: reqwest::Client,
    token: CancellationToken,
) -> anyhow::Result<RunStats> {
    let store = Store::open(&args.output_directory).await?;

    let source = Arc::new(HttpDataSource::new(client, DEFAULT_BASE_URL));
    let fetcher = FetchClient::new(
        source,
        BackoffPolicy {
            base_delay: args.base_delay,
            max_delay: args.max_delay,
            jitter: true,
        },
        RateLimiter::new(args.rate_limit),
        args.max_retries,
    );

    let vcs: Box<dyn VersionControlPort> = if args.dry_run || args.no_commit {
        Box::new(NoopVcs)
    } else {
        Box::new(GitCli::new(args.output_directory.clone()))
    };

    let collector = Collector::new(config, fetcher, store, vcs, token);
    let stats = collector.run().await;

    if let Some(days) = args.cleanup_days {
        if args.dry_run {
            tracing::info!("[dry run] skipping retention sweep");
        } else if let Err(err) = collector.store().cleanup_old_files(days).await {
            tracing::warn!("Retention sweep failed: {err}");
        }
    }

    Ok(stats)
}
