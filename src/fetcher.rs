use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

/// Turns an article URL into its text. Failures must be errors, not empty text.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub text_selector: String,
}

pub struct HttpFetcher {
    client: reqwest::Client,
    selector: Selector,
    max_retries: u32,
    base_backoff: Duration,
}

enum Attempt {
    Retry(String),
    GiveUp(String),
}

impl HttpFetcher {
    pub fn new(opts: &FetchOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(opts.timeout)
            .user_agent(opts.user_agent.as_str())
            .build()
            .map_err(|e| PipelineError::Config(format!("http client: {}", e)))?;
        let selector = Selector::parse(&opts.text_selector).map_err(|e| {
            PipelineError::Config(format!("text selector {:?}: {}", opts.text_selector, e))
        })?;
        Ok(Self {
            client,
            selector,
            max_retries: opts.max_retries,
            base_backoff: opts.base_backoff,
        })
    }

    /// Raw response body, retrying rate limits and server errors with backoff.
    pub async fn get_body(&self, url: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.get_once(url).await {
                Ok(body) => return Ok(body),
                Err(Attempt::Retry(reason)) if attempt < self.max_retries => {
                    let backoff = self.base_backoff * 2u32.pow(attempt);
                    warn!(
                        "{} on {} (attempt {}/{}), backing off {:.1}s",
                        reason,
                        url,
                        attempt + 1,
                        self.max_retries,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(Attempt::Retry(reason)) | Err(Attempt::GiveUp(reason)) => {
                    return Err(PipelineError::fetch(url, reason));
                }
            }
        }
    }

    async fn get_once(&self, url: &str) -> std::result::Result<String, Attempt> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                Attempt::Retry(e.to_string())
            } else {
                Attempt::GiveUp(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(Attempt::Retry(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(Attempt::GiveUp(format!("HTTP {}", status)));
        }
        response.text().await.map_err(|e| Attempt::GiveUp(e.to_string()))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let body = self.get_body(url).await?;
        let text = html_to_text(&body, &self.selector);
        debug!(url, bytes = text.len(), "parsed article text");
        Ok(text)
    }
}

/// Text of every element matching `selector`, one element per line.
pub fn html_to_text(html: &str, selector: &Selector) -> String {
    let document = Html::parse_document(html);
    document
        .select(selector)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedUrl {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct FetchReport {
    /// URLs that produced text, parallel to `texts`.
    pub fetched: Vec<String>,
    pub texts: Vec<String>,
    pub skipped: Vec<SkippedUrl>,
}

pub fn progress_bar(len: usize, enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb
}

/// Fetch every URL with at most `concurrency` requests in flight. Output
/// keeps input order. A recoverable failure is logged and reported as a
/// skip; anything else aborts the batch.
pub async fn extract_text(
    fetcher: &dyn Fetcher,
    urls: &[String],
    concurrency: usize,
    pb: &ProgressBar,
) -> Result<FetchReport> {
    let results: Vec<(String, Result<String>)> = stream::iter(urls.iter().cloned())
        .map(|url| async move {
            let result = fetcher.fetch(&url).await;
            (url, result)
        })
        .buffered(concurrency.max(1))
        .inspect(|_| pb.inc(1))
        .collect()
        .await;

    let mut report = FetchReport::default();
    for (url, result) in results {
        match result {
            Ok(text) => {
                report.fetched.push(url);
                report.texts.push(text);
            }
            Err(e) if e.is_recoverable() => {
                warn!(url = %url, error = %e, "skipping url");
                report.skipped.push(SkippedUrl {
                    url,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                pb.abandon();
                return Err(e);
            }
        }
    }
    pb.finish_and_clear();

    info!(
        "Fetched {} urls ({} ok, {} skipped)",
        urls.len(),
        report.fetched.len(),
        report.skipped.len()
    );
    Ok(report)
}
