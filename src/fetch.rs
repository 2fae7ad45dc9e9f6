use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::warn;
use url::Url;

pub const BASE_URL: &str = "https://www.amazon.co.jp";

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status} for {url}")]
    Status { status: StatusCode, url: String },
}

/// One loaded result page: the document body plus the URL the browser
/// actually ended up on after redirects.
pub struct LoadedPage {
    pub url: Url,
    pub html: String,
}

/// Navigation capability of the order-history site. Pages are obtained one
/// at a time; there is no bulk-fetch mode.
#[async_trait]
pub trait PageSource {
    /// Navigate to one result page of the given year.
    async fn load(&self, year: u16, start_index: u32) -> Result<LoadedPage, FetchError>;

    /// Plain GET of an absolute URL (invoice popovers).
    async fn fetch_html(&self, url: &str) -> Result<String, FetchError>;
}

/// Resolve a site-relative path against the base origin. Absolute URLs and
/// empty strings pass through unchanged.
pub fn full_url(path: &str) -> String {
    if path.is_empty() || path.starts_with("http") {
        path.to_string()
    } else {
        format!("{BASE_URL}{path}")
    }
}

pub struct Client {
    http: reqwest::Client,
}

impl Client {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { http })
    }

    async fn get_with_retry(&self, url: &str) -> Result<(Url, String), FetchError> {
        let mut attempt = 0;
        loop {
            let response = self.http.get(url).send().await?;
            let status = response.status();

            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if retryable && attempt < MAX_RETRIES {
                let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
                warn!(
                    "HTTP {} on {} (attempt {}/{}), backing off {:.1}s",
                    status,
                    url,
                    attempt + 1,
                    MAX_RETRIES,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::Status {
                    status,
                    url: url.to_string(),
                });
            }

            let final_url = response.url().clone();
            let html = response.text().await?;
            return Ok((final_url, html));
        }
    }
}

#[async_trait]
impl PageSource for Client {
    async fn load(&self, year: u16, start_index: u32) -> Result<LoadedPage, FetchError> {
        let url = crate::page::orders_url(year, start_index);
        let (url, html) = self.get_with_retry(&url).await?;
        Ok(LoadedPage { url, html })
    }

    async fn fetch_html(&self, url: &str) -> Result<String, FetchError> {
        Ok(self.get_with_retry(url).await?.1)
    }
}
