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

use async_trait::async_trait;
use rand::Rng as _;
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::bytes::Bytes;

use crate::series::SeriesKind;

pub const DEFAULT_BASE_URL: &str = "https://survey.tmiph.metro.tokyo.lg.jp/epidinfo";

const PREF_CODE_TOKYO: &str = "13";
const HC_CODE_ALL: &str = "00";
const TOTAL_MODE_SUM: &str = "0";

const RATE_LIMIT_STATUS: u16 = 429;

/// Raw failure reported by a data source. Classification into transient
/// and permanent happens in the client, keyed on the status code.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("upstream returned status {status}")]
    Status { status: u16 },
    #[error("transport error: {message}")]
    Transport { message: String },
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("client error {status} for {series} {year}/{period:02}: not retrying")]
    Permanent {
        series: &'static str,
        year: i32,
        period: u32,
        status: u16,
    },
    #[error("upstream error {status} for {series} {year}/{period:02}: failed after {attempts} attempts")]
    Upstream {
        series: &'static str,
        year: i32,
        period: u32,
        status: u16,
        attempts: u32,
    },
    #[error("network error {message} for {series} {year}/{period:02}: failed after {attempts} attempts")]
    Network {
        series: &'static str,
        year: i32,
        period: u32,
        message: String,
        attempts: u32,
    },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::Permanent { .. })
    }
}

/// One upstream call for a single (series, year, period) cell.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch(&self, series: SeriesKind, year: i32, period: u32)
        -> Result<Bytes, SourceError>;
}

/// POSTs the download form to the surveillance system. The returned CSV
/// bytes (Shift_JIS) are passed through untouched.
pub struct HttpDataSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDataSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn fetch(
        &self,
        series: SeriesKind,
        year: i32,
        period: u32,
    ) -> Result<Bytes, SourceError> {
        let year = year.to_string();
        let period = period.to_string();
        let form = [
            ("val(reportType)", series.report_type()),
            ("val(prefCode)", PREF_CODE_TOKYO),
            ("val(hcCode)", HC_CODE_ALL),
            ("val(epidCode)", series.epid_code()),
            ("val(startYear)", year.as_str()),
            ("val(startSubPeriod)", period.as_str()),
            ("val(endYear)", year.as_str()),
            ("val(endSubPeriod)", period.as_str()),
            ("val(totalMode)", TOTAL_MODE_SUM),
        ];

        let url = format!("{}/{}", self.base_url, series.endpoint());
        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|err| SourceError::Transport {
                message: err
                    .source()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| err.to_string()),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
            });
        }
        response.bytes().await.map_err(|err| SourceError::Transport {
            message: err.to_string(),
        })
    }
}

/// Exponential backoff schedule with an absolute cap and optional jitter.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^attempt, max)`, plus up to 0.5s of jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());
        let jitter = if self.jitter {
            rand::thread_rng().gen_range(0.0..0.5)
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + jitter)
    }
}

/// Enforces a minimum spacing between any two upstream calls, across
/// retries and series. The last-call instant is shared state; callers are
/// serialized while they wait.
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(last) = *last_call {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub data: Bytes,
    pub attempts: u32,
    pub elapsed: Duration,
}

enum Classified {
    Fatal,
    Retriable { rate_limited: bool },
}

fn classify(err: &SourceError) -> Classified {
    match err {
        SourceError::Status { status } if *status == RATE_LIMIT_STATUS => {
            Classified::Retriable { rate_limited: true }
        }
        SourceError::Status { status } if (400..500).contains(status) => Classified::Fatal,
        // 5xx and anything else unexpected from upstream.
        SourceError::Status { .. } => Classified::Retriable {
            rate_limited: false,
        },
        SourceError::Transport { .. } => Classified::Retriable {
            rate_limited: false,
        },
    }
}

/// Wraps a `DataSource` with rate limiting, bounded retries and error
/// classification. Transient failures (timeouts, connection errors, 5xx,
/// 429) are retried with exponential backoff; other 4xx surface
/// immediately as permanent.
pub struct FetchClient {
    source: Arc<dyn DataSource>,
    policy: BackoffPolicy,
    limiter: RateLimiter,
    max_retries: u32,
}

impl FetchClient {
    pub fn new(
        source: Arc<dyn DataSource>,
        policy: BackoffPolicy,
        limiter: RateLimiter,
        max_retries: u32,
    ) -> Self {
        Self {
            source,
            policy,
            limiter,
            max_retries,
        }
    }

    pub async fn fetch(
        &self,
        series: SeriesKind,
        year: i32,
        period: u32,
    ) -> Result<FetchOutcome, FetchError> {
        let started = Instant::now();

        for attempt in 0..=self.max_retries {
            self.limiter.acquire().await;

            let err = match self.source.fetch(series, year, period).await {
                Ok(data) => {
                    return Ok(FetchOutcome {
                        data,
                        attempts: attempt + 1,
                        elapsed: started.elapsed(),
                    })
                }
                Err(err) => err,
            };

            let attempts = attempt + 1;
            match classify(&err) {
                Classified::Fatal => {
                    return Err(into_fetch_error(series, year, period, err, attempts))
                }
                Classified::Retriable { rate_limited } => {
                    if attempt == self.max_retries {
                        return Err(into_fetch_error(series, year, period, err, attempts));
                    }
                    // Rate-limit responses double the standard backoff.
                    let delay = if rate_limited {
                        self.policy.delay(attempt) * 2
                    } else {
                        self.policy.delay(attempt)
                    };
                    tracing::warn!(
                        "Attempt {attempts} for {series} {year}/{period:02} failed: {err}. \
                         Retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    sleep(delay).await;
                }
            }
        }

        unreachable!()
    }
}

fn into_fetch_error(
    series: SeriesKind,
    year: i32,
    period: u32,
    err: SourceError,
    attempts: u32,
) -> FetchError {
    let series = series.name();
    match err {
        SourceError::Status { status }
            if status != RATE_LIMIT_STATUS && (400..500).contains(&status) =>
        {
            FetchError::Permanent {
                series,
                year,
                period,
                status,
            }
        }
        SourceError::Status { status } => FetchError::Upstream {
            series,
            year,
            period,
            status,
            attempts,
        },
        SourceError::Transport { message } => FetchError::Network {
            series,
            year,
            period,
            message,
            attempts,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }

    fn client_for(server: &Server, max_retries: u32) -> FetchClient {
        let source = HttpDataSource::new(reqwest::Client::new(), server.url());
        FetchClient::new(
            Arc::new(source),
            no_jitter(),
            RateLimiter::new(Duration::ZERO),
            max_retries,
        )
    }

    #[test]
    fn backoff_schedule_is_capped() {
        let policy = no_jitter();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(10));
        assert_eq!(policy.delay(10), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_under_half_second() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..50 {
            let delay = policy.delay(0);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_secs_f64(1.5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_out_calls() {
        let limiter = RateLimiter::new(Duration::from_secs(2));

        limiter.acquire().await;
        let before = Instant::now();
        limiter.acquire().await;
        assert!(before.elapsed() >= Duration::from_secs(2));

        // Well past the interval, the next acquire does not wait.
        sleep(Duration::from_secs(5)).await;
        let before = Instant::now();
        limiter.acquire().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn fetch_posts_the_download_form() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/dlwzensu.do")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("val(reportType)".into(), "20".into()),
                Matcher::UrlEncoded("val(prefCode)".into(), "13".into()),
                Matcher::UrlEncoded("val(startYear)".into(), "2024".into()),
                Matcher::UrlEncoded("val(startSubPeriod)".into(), "7".into()),
                Matcher::UrlEncoded("val(endSubPeriod)".into(), "7".into()),
                Matcher::UrlEncoded("val(totalMode)".into(), "0".into()),
            ]))
            .with_status(200)
            .with_body("csv,bytes")
            .create_async()
            .await;

        let client = client_for(&server, 3);
        let outcome = client
            .fetch(SeriesKind::NotifiableWeekly, 2024, 7)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(outcome.data.as_ref(), b"csv,bytes");
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn client_error_is_permanent_and_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/dlwgender.do")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, 5);
        let err = client
            .fetch(SeriesKind::SentinelWeeklyGender, 2024, 1)
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(!err.is_transient());
        assert!(matches!(
            err,
            FetchError::Permanent {
                series: "sentinel_weekly_gender",
                status: 404,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_is_retried_until_exhaustion() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/dlwage.do")
            .with_status(500)
            .expect(4)
            .create_async()
            .await;

        let client = client_for(&server, 3);
        let err = client
            .fetch(SeriesKind::SentinelWeeklyAge, 2024, 1)
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(err.is_transient());
        assert!(matches!(
            err,
            FetchError::Upstream {
                status: 500,
                attempts: 4,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_is_retried_as_transient() {
        let mut server = Server::new_async().await;
        let limited = server
            .mock("POST", "/dlmgender.do")
            .with_status(429)
            .expect(2)
            .create_async()
            .await;

        let client = client_for(&server, 1);
        let err = client
            .fetch(SeriesKind::SentinelMonthlyGender, 2024, 6)
            .await
            .unwrap_err();

        limited.assert_async().await;
        assert!(err.is_transient());
        assert!(matches!(err, FetchError::Upstream { status: 429, .. }));
    }

    #[tokio::test]
    async fn connection_failure_is_a_network_error() {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        // Reserved TEST-NET-1 address; nothing listens there.
        let source = HttpDataSource::new(http_client, "http://192.0.2.1:9");
        let client = FetchClient::new(
            Arc::new(source),
            BackoffPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: false,
            },
            RateLimiter::new(Duration::ZERO),
            0,
        );

        let err = client
            .fetch(SeriesKind::NotifiableWeekly, 2024, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network { attempts: 1, .. }));
    }
}
