use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::schema::SummaryDocument;

use super::{normalize_payload, FetchedIndex, IndexSource};

/// Index loaded from the local filesystem. In strict legacy mode the file
/// must hold a legacy summary array; anything else is a hard failure.
pub struct FileSource {
    path: PathBuf,
    location: String,
    legacy_only: bool,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            location: path.to_string_lossy().into_owned(),
            path,
            legacy_only: false,
        }
    }

    pub fn legacy(path: impl AsRef<Path>) -> Self {
        Self {
            legacy_only: true,
            ..Self::new(path)
        }
    }

    fn read_json(path: &Path) -> Result<Value> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))
    }
}

#[async_trait::async_trait]
impl IndexSource for FileSource {
    fn location(&self) -> &str {
        &self.location
    }

    fn refreshable(&self) -> bool {
        false
    }

    async fn fetch_index(&self) -> Result<FetchedIndex> {
        let payload = Self::read_json(&self.path)?;
        if self.legacy_only && !payload.is_array() {
            bail!("expected legacy summary array in {}", self.path.display());
        }
        normalize_payload(&self.location, payload)
    }

    async fn fetch_summary(&self, path: &str) -> Result<SummaryDocument> {
        let resolved = match self.path.parent() {
            Some(parent) => parent.join(path),
            None => PathBuf::from(path),
        };
        let payload = Self::read_json(&resolved)?;
        Ok(serde_json::from_value(payload)?)
    }
}
