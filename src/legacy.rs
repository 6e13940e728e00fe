//! Legacy `summary.json` normalizer.
//!
//! The old pipeline wrote one flat array of result rows per output directory,
//! predating the index/summary split. This module reshapes such an array into
//! a v1 [`IndexDocument`] plus a synthesized [`SummaryDocument`] per run, so
//! the rest of the system only ever sees the canonical schema.

use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::logging::{json_log, obj, v_num, v_str};
use crate::schema::{
    ArtifactPaths, Dataset, IndexDocument, Metrics, Progress, RunRecord, SampleCounts,
    SummaryDocument,
};

/// One row of a legacy results array. Older writers disagreed on the
/// identifier field name, so all known aliases are kept.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyRow {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default, rename = "runId")]
    pub run_id_camel: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub experiment: Option<String>,
    #[serde(default)]
    pub test_accuracy: Option<f64>,
    #[serde(default)]
    pub test_loss: Option<f64>,
    #[serde(default)]
    pub best_val_loss: Option<f64>,
    #[serde(default)]
    pub train_samples: Option<u64>,
    #[serde(default)]
    pub val_samples: Option<u64>,
    #[serde(default)]
    pub test_samples: Option<u64>,
    #[serde(default)]
    pub epochs: Option<u32>,
    #[serde(default)]
    pub feature_set: Option<Vec<String>>,
    #[serde(default)]
    pub patch_window: Option<String>,
    #[serde(default)]
    pub patches: Option<Vec<Value>>,
}

/// A legacy array reshaped into the canonical schema. The summaries are
/// inline: nothing remains to fetch for these runs.
#[derive(Debug, Clone)]
pub struct LegacyIndex {
    pub document: IndexDocument,
    pub summaries: Vec<(String, SummaryDocument)>,
}

/// First non-empty string among ordered alias candidates. Explicit fallback
/// order replaces the truthiness chains the legacy writers relied on.
pub fn first_non_empty<'a>(candidates: &[&'a Option<String>]) -> Option<&'a str> {
    candidates
        .iter()
        .filter_map(|c| c.as_deref())
        .find(|s| !s.is_empty())
}

fn digits(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn utc_instant(y: u32, mo: u32, d: u32, h: u32, mi: u32, se: u32) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(y as i32, mo, d)?;
    let naive = date.and_hms_opt(h, mi, se)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Infer a UTC instant from a run identifier.
///
/// Two shapes are recognized: the whole identifier as `YYYYMMDD_HHMMSS`, or
/// a `YYYY-MM-DDTHH-MM-SSZ` dashed prefix (trailing suffix ignored).
/// Impossible dates and every other shape yield `None`, never an error.
pub fn parse_run_id_timestamp(run_id: &str) -> Option<DateTime<Utc>> {
    if !run_id.is_ascii() {
        return None;
    }
    let bytes = run_id.as_bytes();

    if run_id.len() == 15 && bytes[8] == b'_' {
        let (y, mo, d) = (digits(&run_id[..4])?, digits(&run_id[4..6])?, digits(&run_id[6..8])?);
        let (h, mi, se) = (
            digits(&run_id[9..11])?,
            digits(&run_id[11..13])?,
            digits(&run_id[13..15])?,
        );
        return utc_instant(y, mo, d, h, mi, se);
    }

    // Dashed prefix: 2024-01-15T09-30-00Z...
    let prefix = run_id.get(..20)?;
    let p = prefix.as_bytes();
    let punct_ok = p[4] == b'-'
        && p[7] == b'-'
        && p[10] == b'T'
        && p[13] == b'-'
        && p[16] == b'-'
        && p[19] == b'Z';
    if !punct_ok {
        return None;
    }
    let (y, mo, d) = (digits(&prefix[..4])?, digits(&prefix[5..7])?, digits(&prefix[8..10])?);
    let (h, mi, se) = (
        digits(&prefix[11..13])?,
        digits(&prefix[14..16])?,
        digits(&prefix[17..19])?,
    );
    utc_instant(y, mo, d, h, mi, se)
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Batch-wide dataset label: one patched row marks the whole batch.
pub fn infer_dataset_label(rows: &[LegacyRow]) -> &'static str {
    let patched = rows.iter().any(|row| {
        row.patch_window.as_deref().is_some_and(|w| !w.is_empty())
            || row.patches.as_ref().is_some_and(|p| !p.is_empty())
    });
    if patched {
        "Patch window"
    } else {
        "Clean 2025"
    }
}

/// Reshape legacy rows into a v1 index plus inline summaries.
///
/// Rows without any identifier alias are dropped; that filtering is
/// intentional (no identifier, no record) and only counted in the log.
pub fn build_legacy_index(rows: &[LegacyRow]) -> LegacyIndex {
    let generated_at = iso(Utc::now());
    let dataset = Dataset {
        label: Some(infer_dataset_label(rows).to_string()),
        ..Default::default()
    };

    let mut runs = Vec::new();
    let mut summaries = Vec::new();
    let mut dropped = 0usize;

    for row in rows {
        let Some(run_id) =
            first_non_empty(&[&row.run_id, &row.run_id_camel, &row.id, &row.experiment])
        else {
            dropped += 1;
            continue;
        };

        let experiment = row
            .experiment
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(run_id);
        let category = experiment
            .strip_prefix("exp-")
            .map(str::to_string)
            .unwrap_or_else(|| "legacy".to_string());
        let metrics = Metrics {
            accuracy: row.test_accuracy,
            loss: row.test_loss,
            best_val_loss: row.best_val_loss,
            top_k: None,
        };
        let inferred = parse_run_id_timestamp(run_id).map(iso);

        runs.push(RunRecord {
            run_id: run_id.to_string(),
            display_name: Some(experiment.to_string()),
            status: Some("completed".to_string()),
            category: Some(category.clone()),
            dataset: Some(dataset.clone()),
            metrics: metrics.clone(),
            ..Default::default()
        });

        // Artifact paths exist only in the new directory layout, which
        // requires the raw experiment and run_id fields (not the aliases).
        let paths = match (row.experiment.as_deref(), row.run_id.as_deref()) {
            (Some(exp), Some(rid)) if !exp.is_empty() && !rid.is_empty() => Some(ArtifactPaths {
                config: Some(format!("{}/{}/config.json", exp, rid)),
                metrics: Some(format!("{}/{}/metrics.json", exp, rid)),
                model: Some(format!("{}/{}/model.pth", exp, rid)),
            }),
            _ => None,
        };

        summaries.push((
            run_id.to_string(),
            SummaryDocument {
                schema_version: Some("1.0".to_string()),
                run_id: Some(run_id.to_string()),
                display_name: Some(experiment.to_string()),
                status: Some("completed".to_string()),
                created_at: inferred.clone(),
                updated_at: inferred,
                description: Some(match &row.feature_set {
                    Some(features) if !features.is_empty() => {
                        format!("Feature set: {}", features.join(", "))
                    }
                    _ => "Legacy training run summary.".to_string(),
                }),
                category: Some(category),
                dataset: Some(dataset.clone()),
                progress: row.epochs.map(|epochs| Progress {
                    epoch: Some(epochs),
                    epochs: Some(epochs),
                }),
                metrics,
                samples: Some(SampleCounts {
                    train: row.train_samples,
                    val: row.val_samples,
                    test: row.test_samples,
                }),
                paths,
            },
        ));
    }

    if dropped > 0 {
        json_log(
            "legacy_normalize",
            obj(&[
                ("dropped_rows", v_num(dropped as f64)),
                ("reason", v_str("no_identifier")),
            ]),
        );
    }

    LegacyIndex {
        document: IndexDocument {
            schema_version: Some("1.0".to_string()),
            generated_at: Some(generated_at),
            runs,
            ..Default::default()
        },
        summaries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(json: &str) -> Vec<LegacyRow> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn compact_run_id_parses() {
        let ts = parse_run_id_timestamp("20240115_093000").unwrap();
        assert_eq!(iso(ts), "2024-01-15T09:30:00Z");
    }

    #[test]
    fn dashed_prefix_parses() {
        let ts = parse_run_id_timestamp("2024-01-15T09-30-00Z-foo").unwrap();
        assert_eq!(iso(ts), "2024-01-15T09:30:00Z");
    }

    #[test]
    fn garbage_run_id_yields_none() {
        assert!(parse_run_id_timestamp("not-a-run-id").is_none());
        assert!(parse_run_id_timestamp("").is_none());
        // Shape matches but the date does not exist.
        assert!(parse_run_id_timestamp("20241315_093000").is_none());
        assert!(parse_run_id_timestamp("20240230_250000").is_none());
    }

    #[test]
    fn identifier_alias_priority() {
        let rows = rows(
            r#"[
                {"runId": "camel", "id": "plain", "experiment": "exp-a"},
                {"id": "plain-only"},
                {"experiment": "exp-last"},
                {"run_id": "", "id": "empty-skipped"}
            ]"#,
        );
        let legacy = build_legacy_index(&rows);
        let ids: Vec<_> = legacy.document.runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["camel", "plain-only", "exp-last", "empty-skipped"]);
    }

    #[test]
    fn rows_without_identifier_are_dropped() {
        let rows = rows(r#"[{"test_accuracy": 0.9}, {"run_id": "r1"}]"#);
        let legacy = build_legacy_index(&rows);
        assert_eq!(legacy.document.runs.len(), 1);
        assert_eq!(legacy.summaries.len(), 1);
    }

    #[test]
    fn category_strips_exp_prefix_or_defaults() {
        let rows = rows(
            r#"[
                {"run_id": "a", "experiment": "exp-augment"},
                {"run_id": "b", "experiment": "baseline"}
            ]"#,
        );
        let legacy = build_legacy_index(&rows);
        assert_eq!(legacy.document.runs[0].category.as_deref(), Some("augment"));
        assert_eq!(legacy.document.runs[1].category.as_deref(), Some("legacy"));
    }

    #[test]
    fn dataset_label_inferred_per_batch() {
        let clean = rows(r#"[{"run_id": "a"}, {"run_id": "b"}]"#);
        assert_eq!(infer_dataset_label(&clean), "Clean 2025");

        let patched = rows(r#"[{"run_id": "a"}, {"run_id": "b", "patch_window": "w1"}]"#);
        assert_eq!(infer_dataset_label(&patched), "Patch window");
        let legacy = build_legacy_index(&patched);
        for run in &legacy.document.runs {
            let label = run.dataset.as_ref().unwrap().label.as_deref();
            assert_eq!(label, Some("Patch window"));
        }

        let empty_patches = rows(r#"[{"run_id": "a", "patches": []}]"#);
        assert_eq!(infer_dataset_label(&empty_patches), "Clean 2025");
    }

    #[test]
    fn artifact_paths_need_both_raw_fields() {
        let rows = rows(
            r#"[
                {"run_id": "20240115_093000", "experiment": "exp-a"},
                {"id": "only-id", "experiment": "exp-a"}
            ]"#,
        );
        let legacy = build_legacy_index(&rows);
        let with = legacy.summaries[0].1.paths.as_ref().unwrap();
        assert_eq!(
            with.config.as_deref(),
            Some("exp-a/20240115_093000/config.json")
        );
        assert_eq!(with.model.as_deref(), Some("exp-a/20240115_093000/model.pth"));
        assert!(legacy.summaries[1].1.paths.is_none());
    }

    #[test]
    fn synthesized_summary_carries_inferred_dates_and_metrics() {
        let rows = rows(
            r#"[{
                "run_id": "20240115_093000",
                "experiment": "exp-a",
                "test_accuracy": 0.91,
                "epochs": 12,
                "feature_set": ["elo", "form"]
            }]"#,
        );
        let legacy = build_legacy_index(&rows);
        let (_, summary) = &legacy.summaries[0];
        assert_eq!(summary.created_at.as_deref(), Some("2024-01-15T09:30:00Z"));
        assert_eq!(summary.updated_at.as_deref(), Some("2024-01-15T09:30:00Z"));
        assert_eq!(summary.metrics.accuracy, Some(0.91));
        assert_eq!(summary.metrics.loss, None);
        assert_eq!(summary.description.as_deref(), Some("Feature set: elo, form"));
        let progress = summary.progress.as_ref().unwrap();
        assert_eq!(progress.epoch, Some(12));
        assert_eq!(progress.epochs, Some(12));
    }

    #[test]
    fn legacy_runs_are_inline() {
        let rows = rows(r#"[{"run_id": "r1"}]"#);
        let legacy = build_legacy_index(&rows);
        assert!(legacy.document.runs[0].summary_path.is_none());
        assert!(legacy.document.runs[0].summary_base_url.is_none());
    }
}
