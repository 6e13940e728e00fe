use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::legacy::{build_legacy_index, LegacyRow};
use crate::schema::{IndexDocument, SummaryDocument};

mod file;
mod http;
pub mod retry;

pub use file::FileSource;
pub use http::HttpSource;

use retry::RetryConfig;

/// Where a configured source location points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Http,
    File,
    LegacyFile,
}

impl SourceKind {
    /// Classify a source spec. `legacy:` forces the strict legacy-array
    /// reading of a local file.
    pub fn detect(spec: &str) -> (Self, &str) {
        if let Some(path) = spec.strip_prefix("legacy:") {
            (SourceKind::LegacyFile, path)
        } else if spec.starts_with("http://") || spec.starts_with("https://") {
            (SourceKind::Http, spec)
        } else {
            (SourceKind::File, spec)
        }
    }

    pub fn build(
        self,
        location: &str,
        retry: RetryConfig,
    ) -> Result<Box<dyn IndexSource + Send + Sync>> {
        match self {
            SourceKind::Http => Ok(Box::new(HttpSource::new(location, retry)?)),
            SourceKind::File => Ok(Box::new(FileSource::new(location))),
            SourceKind::LegacyFile => Ok(Box::new(FileSource::legacy(location))),
        }
    }
}

/// Build a source from a configured spec string.
pub fn build_source(spec: &str, retry: RetryConfig) -> Result<Box<dyn IndexSource + Send + Sync>> {
    let (kind, location) = SourceKind::detect(spec);
    kind.build(location, retry)
}

/// A fetched index: the normalized document plus any summaries the payload
/// carried inline (legacy arrays ship theirs with the index).
#[derive(Debug, Clone)]
pub struct FetchedIndex {
    pub location: String,
    pub document: IndexDocument,
    pub summaries: Vec<(String, SummaryDocument)>,
    pub summary_inline: bool,
}

#[async_trait]
pub trait IndexSource {
    /// Resolved location of the index document (absolute URL or file path).
    fn location(&self) -> &str;

    /// Remote sources can be re-polled; local files load once.
    fn refreshable(&self) -> bool;

    /// Fetch and normalize the index document.
    async fn fetch_index(&self) -> Result<FetchedIndex>;

    /// Fetch a summary document at a path relative to this source's index.
    async fn fetch_summary(&self, path: &str) -> Result<SummaryDocument>;
}

/// Normalize a raw payload: an array is the legacy schema, an object the
/// canonical one.
pub(crate) fn normalize_payload(location: &str, payload: Value) -> Result<FetchedIndex> {
    if payload.is_array() {
        let rows: Vec<LegacyRow> = serde_json::from_value(payload)?;
        let legacy = build_legacy_index(&rows);
        return Ok(FetchedIndex {
            location: location.to_string(),
            document: legacy.document,
            summaries: legacy.summaries,
            summary_inline: true,
        });
    }

    let document: IndexDocument = serde_json::from_value(payload)?;
    Ok(FetchedIndex {
        location: location.to_string(),
        document,
        summaries: Vec::new(),
        summary_inline: false,
    })
}

// =============================================================================
// In-memory sources: offline fixtures and degraded-path testing
// =============================================================================

/// Serves a fixed document; stands in for a remote index in tests and
/// offline runs.
#[derive(Debug, Clone)]
pub struct StaticSource {
    location: String,
    document: IndexDocument,
    summaries: Vec<(String, SummaryDocument)>,
    summary_inline: bool,
    refreshable: bool,
}

impl StaticSource {
    pub fn new(location: &str, document: IndexDocument) -> Self {
        Self {
            location: location.to_string(),
            document,
            summaries: Vec::new(),
            summary_inline: false,
            refreshable: true,
        }
    }

    pub fn with_summaries(mut self, summaries: Vec<(String, SummaryDocument)>) -> Self {
        self.summaries = summaries;
        self
    }

    pub fn inline(mut self) -> Self {
        self.summary_inline = true;
        self
    }
}

#[async_trait]
impl IndexSource for StaticSource {
    fn location(&self) -> &str {
        &self.location
    }

    fn refreshable(&self) -> bool {
        self.refreshable
    }

    async fn fetch_index(&self) -> Result<FetchedIndex> {
        Ok(FetchedIndex {
            location: self.location.clone(),
            document: self.document.clone(),
            summaries: self.summaries.clone(),
            summary_inline: self.summary_inline,
        })
    }

    async fn fetch_summary(&self, path: &str) -> Result<SummaryDocument> {
        self.summaries
            .iter()
            .find(|(run_id, _)| run_id == path || format!("{}.json", run_id) == path)
            .map(|(_, doc)| doc.clone())
            .ok_or_else(|| anyhow::anyhow!("summary fetch failed (404)"))
    }
}

/// Rejects every fetch with a fixed message.
#[derive(Debug, Clone)]
pub struct FailingSource {
    location: String,
    message: String,
}

impl FailingSource {
    pub fn new(location: &str, message: &str) -> Self {
        Self {
            location: location.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl IndexSource for FailingSource {
    fn location(&self) -> &str {
        &self.location
    }

    fn refreshable(&self) -> bool {
        true
    }

    async fn fetch_index(&self) -> Result<FetchedIndex> {
        Err(anyhow::anyhow!("{}", self.message))
    }

    async fn fetch_summary(&self, _path: &str) -> Result<SummaryDocument> {
        Err(anyhow::anyhow!("{}", self.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_kind_detection() {
        assert_eq!(
            SourceKind::detect("http://host/index.json"),
            (SourceKind::Http, "http://host/index.json")
        );
        assert_eq!(
            SourceKind::detect("https://host/index.json"),
            (SourceKind::Http, "https://host/index.json")
        );
        assert_eq!(
            SourceKind::detect("./out/index.json"),
            (SourceKind::File, "./out/index.json")
        );
        assert_eq!(
            SourceKind::detect("legacy:./summary.json"),
            (SourceKind::LegacyFile, "./summary.json")
        );
    }

    #[test]
    fn array_payload_normalizes_as_legacy() {
        let payload = json!([{"run_id": "r1", "test_accuracy": 0.9}]);
        let fetched = normalize_payload("x/summary.json", payload).unwrap();
        assert!(fetched.summary_inline);
        assert_eq!(fetched.document.runs.len(), 1);
        assert_eq!(fetched.summaries.len(), 1);
        assert_eq!(fetched.document.runs[0].effective_status(), "completed");
    }

    #[test]
    fn object_payload_passes_through() {
        let payload = json!({"schema_version": "1.0", "runs": [{"run_id": "r1"}]});
        let fetched = normalize_payload("x/index.json", payload).unwrap();
        assert!(!fetched.summary_inline);
        assert!(fetched.summaries.is_empty());
        assert_eq!(fetched.document.runs[0].run_id, "r1");
    }
}
