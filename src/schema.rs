//! Canonical run-index data model.
//!
//! Every optional JSON field is an explicit `Option<T>`; documents from
//! either schema generation deserialize into the same types, and absent
//! fields stay absent instead of collapsing into sentinel values.

use serde::{Deserialize, Serialize};

/// Canonical status values in display order. Statuses outside this list are
/// preserved verbatim and appended after the canonical ones in filter options.
pub const STATUS_ORDER: [&str; 5] = ["planned", "running", "completed", "failed", "canceled"];

/// Human label for a status value; unknown statuses are shown as-is.
pub fn status_label(status: &str) -> String {
    match status {
        "planned" => "Planned".to_string(),
        "running" => "Running".to_string(),
        "completed" => "Completed".to_string(),
        "failed" => "Failed".to_string(),
        "canceled" => "Canceled".to_string(),
        other => other.to_string(),
    }
}

/// One experiment run, as listed by an index document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<Dataset>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_base_url: Option<String>,
}

impl RunRecord {
    /// Status with the documented default applied.
    pub fn effective_status(&self) -> &str {
        self.status
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("planned")
    }

    /// Display name, falling back to the run id.
    pub fn display_label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.run_id)
    }
}

/// Summary metrics attached to a run or summary document. The three scalar
/// fields serialize as explicit nulls when absent, matching the index
/// generator's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub loss: Option<f64>,
    #[serde(default)]
    pub best_val_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<TopK>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopK {
    #[serde(default)]
    pub k: Option<u32>,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

/// Dataset descriptor. Index generators emit exactly one of the shapes
/// (label, window, or sample counts); merged records may accumulate more.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<DatasetWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<SampleCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetWindow {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleCounts {
    #[serde(default)]
    pub train: Option<u64>,
    #[serde(default)]
    pub val: Option<u64>,
    #[serde(default)]
    pub test: Option<u64>,
}

/// Per-run detail payload, fetched lazily or synthesized for legacy rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<Dataset>,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<SampleCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<ArtifactPaths>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub epoch: Option<u32>,
    #[serde(default)]
    pub epochs: Option<u32>,
}

/// Relative artifact locations published by a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ArtifactPaths {
    pub fn is_empty(&self) -> bool {
        self.config.is_none() && self.metrics.is_none() && self.model.is_none()
    }
}

/// Top-level container enumerating all known runs plus baseline pointers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub runs: Vec<RunRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_baseline_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_to_beat_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_updated_at: Option<String>,
}

impl IndexDocument {
    pub fn run(&self, run_id: &str) -> Option<&RunRecord> {
        self.runs.iter().find(|r| r.run_id == run_id)
    }

    pub fn has_baseline_pointer(&self) -> bool {
        self.true_baseline_run_id.is_some() || self.baseline_to_beat_run_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_defaults_to_planned() {
        let run = RunRecord {
            run_id: "r1".to_string(),
            ..Default::default()
        };
        assert_eq!(run.effective_status(), "planned");

        let run = RunRecord {
            run_id: "r1".to_string(),
            status: Some("".to_string()),
            ..Default::default()
        };
        assert_eq!(run.effective_status(), "planned");
    }

    #[test]
    fn unknown_status_preserved() {
        let run: RunRecord =
            serde_json::from_str(r#"{"run_id": "r1", "status": "archived"}"#).unwrap();
        assert_eq!(run.effective_status(), "archived");
        assert_eq!(status_label(run.effective_status()), "archived");
    }

    #[test]
    fn display_label_falls_back_to_run_id() {
        let run = RunRecord {
            run_id: "20240115_093000".to_string(),
            ..Default::default()
        };
        assert_eq!(run.display_label(), "20240115_093000");
    }

    #[test]
    fn index_document_tolerates_sparse_json() {
        let doc: IndexDocument = serde_json::from_str(r#"{"runs": []}"#).unwrap();
        assert!(doc.runs.is_empty());
        assert!(doc.generated_at.is_none());
        assert!(!doc.has_baseline_pointer());
    }

    #[test]
    fn metrics_nulls_round_trip() {
        let m: Metrics = serde_json::from_str(r#"{"accuracy": 0.91, "loss": null}"#).unwrap();
        assert_eq!(m.accuracy, Some(0.91));
        assert_eq!(m.loss, None);
        let back = serde_json::to_value(&m).unwrap();
        assert!(back.get("loss").unwrap().is_null());
        assert!(back.get("top_k").is_none());
    }
}
