//! Multi-source index merge engine.
//!
//! Combines any number of fetched (and already normalized) index documents
//! into one collection keyed by `run_id`. Later sources override earlier
//! ones field-by-field; absent fields never erase known values.

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::logging::{json_log, obj, v_num, v_str};
use crate::schema::{Dataset, IndexDocument, Metrics, RunRecord};

/// Error message for the only hard failure mode of a multi-source load.
pub const ALL_SOURCES_FAILED: &str = "unable to load any experiment indexes";

/// One fetched index document tagged with its resolved source location.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub location: String,
    pub document: IndexDocument,
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.is_empty())
}

/// Resolve a list of per-source fetch outcomes into one merged document.
///
/// Failed sources are dropped from the merge; the operation fails only when
/// every configured source failed. Zero configured sources merge to an empty
/// collection.
pub fn merge_fetches(results: Vec<Result<SourceDocument>>) -> Result<IndexDocument> {
    let total = results.len();
    let mut sources = Vec::with_capacity(total);
    for result in results {
        match result {
            Ok(source) => sources.push(source),
            Err(err) => json_log(
                "merge",
                obj(&[
                    ("status", v_str("source_failed")),
                    ("error", v_str(&err.to_string())),
                ]),
            ),
        }
    }

    if total > 0 && sources.is_empty() {
        bail!(ALL_SOURCES_FAILED);
    }

    let merged = merge_documents(&sources);
    json_log(
        "merge",
        obj(&[
            ("status", v_str("ok")),
            ("sources_ok", v_num(sources.len() as f64)),
            ("sources_failed", v_num((total - sources.len()) as f64)),
            ("runs", v_num(merged.runs.len() as f64)),
        ]),
    );
    Ok(merged)
}

/// Merge successfully fetched documents in input order.
pub fn merge_documents(sources: &[SourceDocument]) -> IndexDocument {
    let mut by_id: BTreeMap<String, RunRecord> = BTreeMap::new();

    for source in sources {
        for run in &source.document.runs {
            let mut entry = run.clone();
            // The base for summary resolution is the document the entry came
            // from; a base without a path would pair stale values, so only
            // entries that actually carry a path get stamped.
            if non_empty(&entry.summary_path) {
                entry.summary_base_url = Some(source.location.clone());
            }

            match by_id.entry(entry.run_id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                }
                Entry::Occupied(mut slot) => merge_record(slot.get_mut(), entry),
            }
        }
    }

    let (true_baseline_run_id, baseline_to_beat_run_id, baseline_updated_at) =
        select_baseline(sources);

    IndexDocument {
        schema_version: Some("1.0".to_string()),
        generated_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        runs: by_id.into_values().collect(),
        true_baseline_run_id,
        baseline_to_beat_run_id,
        baseline_updated_at,
    }
}

/// Field-level merge: incoming wins where present. `group_id`,
/// `variant_label`, `summary_path`, and `summary_base_url` additionally
/// ignore present-but-empty incoming values.
fn merge_record(existing: &mut RunRecord, incoming: RunRecord) {
    if incoming.display_name.is_some() {
        existing.display_name = incoming.display_name;
    }
    if incoming.status.is_some() {
        existing.status = incoming.status;
    }
    if incoming.category.is_some() {
        existing.category = incoming.category;
    }
    if non_empty(&incoming.group_id) {
        existing.group_id = incoming.group_id;
    }
    if non_empty(&incoming.variant_label) {
        existing.variant_label = incoming.variant_label;
    }
    if non_empty(&incoming.summary_path) {
        existing.summary_path = incoming.summary_path;
    }
    if non_empty(&incoming.summary_base_url) {
        existing.summary_base_url = incoming.summary_base_url;
    }

    merge_metrics(&mut existing.metrics, incoming.metrics);

    match (&mut existing.dataset, incoming.dataset) {
        (_, None) => {}
        (None, some) => existing.dataset = some,
        (Some(current), Some(incoming)) => merge_dataset(current, incoming),
    }
}

fn merge_metrics(existing: &mut Metrics, incoming: Metrics) {
    if incoming.accuracy.is_some() {
        existing.accuracy = incoming.accuracy;
    }
    if incoming.loss.is_some() {
        existing.loss = incoming.loss;
    }
    if incoming.best_val_loss.is_some() {
        existing.best_val_loss = incoming.best_val_loss;
    }
    if incoming.top_k.is_some() {
        existing.top_k = incoming.top_k;
    }
}

fn merge_dataset(existing: &mut Dataset, incoming: Dataset) {
    if incoming.label.is_some() {
        existing.label = incoming.label;
    }
    if incoming.window.is_some() {
        existing.window = incoming.window;
    }
    if incoming.samples.is_some() {
        existing.samples = incoming.samples;
    }
    if incoming.manifest_path.is_some() {
        existing.manifest_path = incoming.manifest_path;
    }
}

/// Epoch millis of a baseline stamp; anything unparseable sorts first.
fn baseline_stamp_ms(value: &Option<String>) -> i64 {
    value
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.timestamp_millis())
        .unwrap_or(0)
}

/// Baseline pointers come from the source with the freshest
/// `baseline_updated_at` among those that carry a pointer at all; ties keep
/// the first-seen source in input order.
fn select_baseline(
    sources: &[SourceDocument],
) -> (Option<String>, Option<String>, Option<String>) {
    let mut winner: Option<(i64, &IndexDocument)> = None;
    for source in sources {
        let doc = &source.document;
        if !doc.has_baseline_pointer() {
            continue;
        }
        let stamp = baseline_stamp_ms(&doc.baseline_updated_at);
        if winner.map_or(true, |(best, _)| stamp > best) {
            winner = Some((stamp, doc));
        }
    }

    match winner {
        Some((_, doc)) => (
            doc.true_baseline_run_id.clone(),
            doc.baseline_to_beat_run_id.clone(),
            doc.baseline_updated_at.clone(),
        ),
        None => (None, None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn run(id: &str) -> RunRecord {
        RunRecord {
            run_id: id.to_string(),
            ..Default::default()
        }
    }

    fn source(location: &str, runs: Vec<RunRecord>) -> SourceDocument {
        SourceDocument {
            location: location.to_string(),
            document: IndexDocument {
                runs,
                ..Default::default()
            },
        }
    }

    #[test]
    fn duplicate_ids_collapse_to_one_record() {
        let merged = merge_documents(&[
            source("a/index.json", vec![run("r1"), run("r2")]),
            source("b/index.json", vec![run("r2"), run("r3")]),
        ]);
        let ids: Vec<_> = merged.runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
    }

    #[test]
    fn output_sorted_by_run_id() {
        let merged = merge_documents(&[source(
            "a/index.json",
            vec![run("zeta"), run("alpha"), run("mid")],
        )]);
        let ids: Vec<_> = merged.runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn incoming_fields_win_but_absent_fields_do_not_erase() {
        let mut base = run("r1");
        base.summary_path = Some("a.json".to_string());
        base.group_id = Some("g1".to_string());
        base.metrics.accuracy = Some(0.5);

        let mut incoming = run("r1");
        incoming.metrics.loss = Some(0.2);

        let merged = merge_documents(&[
            source("http://a/index.json", vec![base]),
            source("http://b/index.json", vec![incoming]),
        ]);
        let r = &merged.runs[0];
        assert_eq!(r.summary_path.as_deref(), Some("a.json"));
        assert_eq!(r.group_id.as_deref(), Some("g1"));
        assert_eq!(r.summary_base_url.as_deref(), Some("http://a/index.json"));
        assert_eq!(r.metrics.accuracy, Some(0.5));
        assert_eq!(r.metrics.loss, Some(0.2));
    }

    #[test]
    fn empty_incoming_strings_do_not_erase_protected_fields() {
        let mut base = run("r1");
        base.group_id = Some("g1".to_string());
        base.variant_label = Some("v1".to_string());

        let mut incoming = run("r1");
        incoming.group_id = Some(String::new());
        incoming.variant_label = Some(String::new());

        let merged = merge_documents(&[
            source("a/index.json", vec![base]),
            source("b/index.json", vec![incoming]),
        ]);
        assert_eq!(merged.runs[0].group_id.as_deref(), Some("g1"));
        assert_eq!(merged.runs[0].variant_label.as_deref(), Some("v1"));
    }

    #[test]
    fn dataset_merges_per_key() {
        let mut base = run("r1");
        base.dataset = Some(Dataset {
            label: Some("Clean 2025".to_string()),
            ..Default::default()
        });
        let mut incoming = run("r1");
        incoming.dataset = Some(Dataset {
            manifest_path: Some("manifest.json".to_string()),
            ..Default::default()
        });

        let merged = merge_documents(&[
            source("a/index.json", vec![base]),
            source("b/index.json", vec![incoming]),
        ]);
        let ds = merged.runs[0].dataset.as_ref().unwrap();
        assert_eq!(ds.label.as_deref(), Some("Clean 2025"));
        assert_eq!(ds.manifest_path.as_deref(), Some("manifest.json"));
    }

    #[test]
    fn summary_base_stamped_per_owning_source() {
        let mut a = run("r1");
        a.summary_path = Some("runs/r1.json".to_string());
        let mut b = run("r2");
        b.summary_path = Some("runs/r2.json".to_string());

        let merged = merge_documents(&[
            source("http://a/index.json", vec![a]),
            source("http://b/exp/index.json", vec![b]),
        ]);
        assert_eq!(
            merged.runs[0].summary_base_url.as_deref(),
            Some("http://a/index.json")
        );
        assert_eq!(
            merged.runs[1].summary_base_url.as_deref(),
            Some("http://b/exp/index.json")
        );
    }

    #[test]
    fn all_sources_failed_is_hard_error() {
        let result = merge_fetches(vec![
            Err(anyhow!("fetch failed (503)")),
            Err(anyhow!("fetch failed (404)")),
            Err(anyhow!("connection refused")),
        ]);
        assert_eq!(result.unwrap_err().to_string(), ALL_SOURCES_FAILED);
    }

    #[test]
    fn partial_failure_is_tolerated() {
        let merged = merge_fetches(vec![
            Ok(source("a/index.json", vec![run("r1")])),
            Err(anyhow!("fetch failed (500)")),
            Ok(source("c/index.json", vec![run("r3")])),
        ])
        .unwrap();
        let ids: Vec<_> = merged.runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r3"]);
    }

    #[test]
    fn no_sources_merge_to_empty_collection() {
        let merged = merge_fetches(Vec::new()).unwrap();
        assert!(merged.runs.is_empty());
    }

    #[test]
    fn merge_is_idempotent_up_to_generated_at() {
        let mut record = run("r1");
        record.summary_path = Some("runs/r1.json".to_string());
        record.metrics.accuracy = Some(0.9);
        let src = source("http://a/index.json", vec![record, run("r2")]);

        let once = merge_documents(&[src.clone()]);
        let twice = merge_documents(&[src.clone(), src]);
        assert_eq!(once.runs, twice.runs);
        assert_eq!(once.baseline_to_beat_run_id, twice.baseline_to_beat_run_id);
    }

    #[test]
    fn freshest_baseline_pointer_wins() {
        let mut a = source("a/index.json", vec![]);
        a.document.baseline_to_beat_run_id = Some("r1".to_string());
        a.document.baseline_updated_at = Some("2024-01-01T00:00:00Z".to_string());
        let mut b = source("b/index.json", vec![]);
        b.document.baseline_to_beat_run_id = Some("r2".to_string());
        b.document.baseline_updated_at = Some("2024-06-01T00:00:00Z".to_string());

        let merged = merge_documents(&[a, b]);
        assert_eq!(merged.baseline_to_beat_run_id.as_deref(), Some("r2"));
        assert_eq!(
            merged.baseline_updated_at.as_deref(),
            Some("2024-06-01T00:00:00Z")
        );
    }

    #[test]
    fn baseline_tie_keeps_first_seen_and_pointerless_docs_are_ignored() {
        let mut a = source("a/index.json", vec![]);
        a.document.true_baseline_run_id = Some("ra".to_string());
        a.document.baseline_updated_at = Some("not-a-date".to_string());
        let mut b = source("b/index.json", vec![]);
        b.document.true_baseline_run_id = Some("rb".to_string());
        // No baseline_updated_at either: both compare as epoch 0.
        let mut c = source("c/index.json", vec![run("r9")]);
        c.document.baseline_updated_at = Some("2030-01-01T00:00:00Z".to_string());

        // c has a fresh stamp but no pointer, so it never contributes.
        let merged = merge_documents(&[a, b, c]);
        assert_eq!(merged.true_baseline_run_id.as_deref(), Some("ra"));
    }
}
