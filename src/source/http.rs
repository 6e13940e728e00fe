use anyhow::Result;
use reqwest::Client;
use serde_json::Value;
use url::Url;

use crate::logging::ts_epoch_ms;
use crate::schema::SummaryDocument;

use super::retry::{retry_async, RetryConfig};
use super::{normalize_payload, FetchedIndex, IndexSource};

/// Non-2xx response, carrying the status so retry logic can classify it.
#[derive(Debug)]
pub struct HttpStatusError {
    pub what: String,
    pub status: u16,
}

impl HttpStatusError {
    pub fn new(what: &str, status: u16) -> Self {
        Self {
            what: what.to_string(),
            status,
        }
    }
}

impl std::fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} fetch failed ({})", self.what, self.status)
    }
}

impl std::error::Error for HttpStatusError {}

/// Remote index served over HTTP.
pub struct HttpSource {
    client: Client,
    url: Url,
    location: String,
    retry: RetryConfig,
}

impl HttpSource {
    pub fn new(location: &str, retry: RetryConfig) -> Result<Self> {
        let url = Url::parse(location)?;
        Ok(Self {
            client: Client::new(),
            location: url.to_string(),
            url,
            retry,
        })
    }

    /// Append a changing `_` query parameter so intermediate caches never
    /// serve a stale document.
    fn cache_busted(url: &Url) -> Url {
        let mut busted = url.clone();
        busted
            .query_pairs_mut()
            .append_pair("_", &ts_epoch_ms().to_string());
        busted
    }

    async fn get_json(&self, url: &Url, what: &str) -> Result<Value> {
        let resp = self
            .client
            .get(Self::cache_busted(url).as_str())
            .header("Cache-Control", "no-store")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HttpStatusError::new(what, status.as_u16()).into());
        }
        Ok(resp.json().await?)
    }
}

#[async_trait::async_trait]
impl IndexSource for HttpSource {
    fn location(&self) -> &str {
        &self.location
    }

    fn refreshable(&self) -> bool {
        true
    }

    async fn fetch_index(&self) -> Result<FetchedIndex> {
        let payload = retry_async(&self.retry, "fetch_index", || {
            self.get_json(&self.url, "index")
        })
        .await?;
        normalize_payload(&self.location, payload)
    }

    async fn fetch_summary(&self, path: &str) -> Result<SummaryDocument> {
        let url = self.url.join(path)?;
        let payload = retry_async(&self.retry, "fetch_summary", || {
            self.get_json(&url, "summary")
        })
        .await?;
        Ok(serde_json::from_value(payload)?)
    }
}
