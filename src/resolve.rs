//! Metric and grouping resolution over a merged run collection.
//!
//! Everything here is a pure function of the collection: group keys and
//! labels, filter option sets, best-run selection, and deltas against a
//! reference run. The rendering layer consumes these values as-is.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::legacy::parse_run_id_timestamp;
use crate::schema::{RunRecord, STATUS_ORDER};

/// Sentinel prepended to every filter option list.
pub const ALL_FILTER: &str = "all";

/// Which scalar is compared when ranking runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricKind {
    #[default]
    Accuracy,
    TopK,
}

impl MetricKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accuracy" => Some(MetricKind::Accuracy),
            "top_k" => Some(MetricKind::TopK),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Accuracy => "accuracy",
            MetricKind::TopK => "top_k",
        }
    }
}

/// How runs are assigned to comparison groups. The index generations never
/// agreed on one scheme, so both survive as selectable policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupPolicy {
    /// `group_id`, falling back to `category`.
    #[default]
    Explicit,
    /// Sniff well-known keywords out of the display name before falling
    /// back to the explicit fields.
    KeywordSniff,
}

impl GroupPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "explicit" => Some(GroupPolicy::Explicit),
            "keywords" => Some(GroupPolicy::KeywordSniff),
            _ => None,
        }
    }
}

const SNIFF_KEYWORDS: &[(&str, &str)] = &[
    ("baseline", "baseline"),
    ("ablation", "ablation"),
    ("augment", "augmentation"),
    ("sweep", "tuning"),
    ("tune", "tuning"),
    ("patch", "patch-window"),
    ("distill", "distillation"),
];

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Group key for one run under the given policy. Always non-empty.
pub fn group_key(run: &RunRecord, policy: GroupPolicy) -> String {
    if policy == GroupPolicy::KeywordSniff {
        let haystack = run.display_label().to_lowercase();
        for (needle, key) in SNIFF_KEYWORDS {
            if haystack.contains(needle) {
                return (*key).to_string();
            }
        }
    }
    non_empty(&run.group_id)
        .or_else(|| non_empty(&run.category))
        .unwrap_or("uncategorized")
        .to_string()
}

/// Display label for a group key: fixed table first, derived title-case
/// otherwise.
pub fn group_label(key: &str) -> String {
    match key {
        "uncategorized" => return "Uncategorized".to_string(),
        "legacy" => return "Legacy".to_string(),
        "baseline" => return "Baseline".to_string(),
        "patch-window" => return "Patch window".to_string(),
        "top_k" => return "Top-K".to_string(),
        _ => {}
    }

    key.split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// The selected metric of one run. Non-numeric values are never coerced;
/// NaN counts as absent.
pub fn selected_metric(run: &RunRecord, kind: MetricKind) -> Option<f64> {
    let value = match kind {
        MetricKind::Accuracy => run.metrics.accuracy,
        MetricKind::TopK => run.metrics.top_k.as_ref().and_then(|t| t.accuracy),
    };
    value.filter(|v| !v.is_nan())
}

pub fn run_accuracy(run: &RunRecord) -> Option<f64> {
    run.metrics.accuracy.filter(|v| !v.is_nan())
}

pub fn run_loss(run: &RunRecord) -> Option<f64> {
    run.metrics.loss.filter(|v| !v.is_nan())
}

/// Accuracy-descending, then loss-ascending ranking, with presence
/// dominating in both rounds: a run that has a value beats one that does
/// not. `Less` means `a` ranks ahead.
pub fn compare_by_accuracy_or_loss(a: &RunRecord, b: &RunRecord) -> Ordering {
    match (run_accuracy(a), run_accuracy(b)) {
        (Some(x), Some(y)) => return y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => return Ordering::Less,
        (None, Some(_)) => return Ordering::Greater,
        (None, None) => {}
    }
    match (run_loss(a), run_loss(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Best run of a set by the selected metric: strictly highest value wins,
/// ties keep the first-seen. When no run carries the metric at all, the run
/// with the latest inferable run-id timestamp wins; runs without one use
/// their position as a recency proxy, so the most-recently-appended wins.
pub fn best_run<'a>(runs: &[&'a RunRecord], kind: MetricKind) -> Option<&'a RunRecord> {
    let mut best: Option<(f64, &RunRecord)> = None;
    for run in runs {
        if let Some(value) = selected_metric(run, kind) {
            if best.map_or(true, |(top, _)| value > top) {
                best = Some((value, run));
            }
        }
    }
    if let Some((_, run)) = best {
        return Some(run);
    }

    let mut fallback: Option<((u8, i64), &RunRecord)> = None;
    for (index, run) in runs.iter().enumerate() {
        let key = match parse_run_id_timestamp(&run.run_id) {
            Some(ts) => (1u8, ts.timestamp()),
            None => (0u8, index as i64),
        };
        if fallback.map_or(true, |(top, _)| key > top) {
            fallback = Some((key, run));
        }
    }
    fallback.map(|(_, run)| run)
}

/// Best run of the whole collection by the selected metric.
pub fn best_overall<'a>(runs: &'a [RunRecord], kind: MetricKind) -> Option<&'a RunRecord> {
    let refs: Vec<&RunRecord> = runs.iter().collect();
    best_run(&refs, kind)
}

/// Signed metric difference against a reference run; `None` when either
/// operand has no metric. Not clamped.
pub fn metric_delta(run: &RunRecord, reference: &RunRecord, kind: MetricKind) -> Option<f64> {
    Some(selected_metric(run, kind)? - selected_metric(reference, kind)?)
}

/// The selected metric over run order — the data series behind the
/// metric-over-runs plot. Gaps stay gaps.
pub fn metric_series(runs: &[RunRecord], kind: MetricKind) -> Vec<Option<f64>> {
    runs.iter().map(|run| selected_metric(run, kind)).collect()
}

/// Best run per group plus its group size.
#[derive(Debug, Clone)]
pub struct GroupBest<'a> {
    pub key: String,
    pub label: String,
    pub run: &'a RunRecord,
    pub count: usize,
}

/// Best run per group by the selected metric (timestamp fallback included),
/// sorted by group label.
pub fn best_by_group<'a>(
    runs: &'a [RunRecord],
    policy: GroupPolicy,
    kind: MetricKind,
) -> Vec<GroupBest<'a>> {
    let mut groups: BTreeMap<String, Vec<&RunRecord>> = BTreeMap::new();
    for run in runs {
        groups.entry(group_key(run, policy)).or_default().push(run);
    }

    let mut result: Vec<GroupBest<'a>> = groups
        .into_iter()
        .filter_map(|(key, members)| {
            let run = best_run(&members, kind)?;
            Some(GroupBest {
                label: group_label(&key),
                key,
                run,
                count: members.len(),
            })
        })
        .collect();
    result.sort_by(|a, b| a.label.cmp(&b.label));
    result
}

/// Best completed run per group under the accuracy-or-loss ranking, the
/// single-index "best grid" behavior: runs whose status is present and not
/// `completed` are skipped, as are runs without accuracy or loss; group
/// counts still cover every run.
pub fn best_completed_by_group<'a>(
    runs: &'a [RunRecord],
    policy: GroupPolicy,
) -> Vec<GroupBest<'a>> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut best: BTreeMap<String, &RunRecord> = BTreeMap::new();

    for run in runs {
        let key = group_key(run, policy);
        *counts.entry(key.clone()).or_insert(0) += 1;

        if run.status.as_deref().is_some_and(|s| s != "completed") {
            continue;
        }
        if run_accuracy(run).is_none() && run_loss(run).is_none() {
            continue;
        }
        match best.entry(key) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(run);
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                if compare_by_accuracy_or_loss(run, slot.get()) == Ordering::Less {
                    slot.insert(run);
                }
            }
        }
    }

    let mut result: Vec<GroupBest<'a>> = best
        .into_iter()
        .map(|(key, run)| GroupBest {
            label: group_label(&key),
            count: counts.get(&key).copied().unwrap_or(0),
            key,
            run,
        })
        .collect();
    result.sort_by(|a, b| a.label.cmp(&b.label));
    result
}

/// Status filter options: canonical statuses in fixed order, then any other
/// statuses encountered in first-seen order, all behind the `all` sentinel.
pub fn status_filter_options(runs: &[RunRecord]) -> Vec<String> {
    let mut seen: Vec<&str> = Vec::new();
    for run in runs {
        if let Some(status) = non_empty(&run.status) {
            if !seen.contains(&status) {
                seen.push(status);
            }
        }
    }

    let mut options = vec![ALL_FILTER.to_string()];
    for canonical in STATUS_ORDER {
        if seen.contains(&canonical) {
            options.push(canonical.to_string());
        }
    }
    for status in seen {
        if !STATUS_ORDER.contains(&status) {
            options.push(status.to_string());
        }
    }
    options
}

/// Group filter options: distinct group keys sorted by display label,
/// behind the `all` sentinel.
pub fn group_filter_options(runs: &[RunRecord], policy: GroupPolicy) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for run in runs {
        let key = group_key(run, policy);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys.sort_by_key(|key| group_label(key));

    let mut options = vec![ALL_FILTER.to_string()];
    options.extend(keys);
    options
}
