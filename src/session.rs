//! Application session: configuration, the load/refresh state machine, and
//! the controller driving sources, merge, and summary caching.
//!
//! The session owns every piece of mutable state. All mutations go through
//! the named transition functions on [`SessionState`]; the async controller
//! methods on [`Session`] only orchestrate I/O around them.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::logging::{json_log, log, obj, v_bool, v_num, v_str, Domain, Level};
use crate::merge::{merge_fetches, SourceDocument};
use crate::resolve::{
    group_filter_options, group_key, status_filter_options, GroupPolicy, MetricKind, ALL_FILTER,
};
use crate::schema::{IndexDocument, RunRecord, SummaryDocument};
use crate::source::retry::RetryConfig;
use crate::source::{build_source, FetchedIndex, IndexSource};

#[derive(Clone)]
pub struct Config {
    /// Index source specs: URLs, file paths, or `legacy:` file paths.
    pub sources: Vec<String>,
    pub metric: MetricKind,
    pub group_policy: GroupPolicy,
    pub refresh_enabled: bool,
    pub refresh_interval_secs: u64,
    pub retry: RetryConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let sources = std::env::var("INDEX_SOURCES")
            .unwrap_or_else(|_| "experiment-index.json".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            sources,
            metric: std::env::var("METRIC")
                .ok()
                .and_then(|v| MetricKind::parse(&v))
                .unwrap_or_default(),
            group_policy: std::env::var("GROUP_POLICY")
                .ok()
                .and_then(|v| GroupPolicy::parse(&v))
                .unwrap_or_default(),
            refresh_enabled: std::env::var("AUTO_REFRESH")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            refresh_interval_secs: std::env::var("REFRESH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            retry: RetryConfig::from_env(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "sources": self.sources,
            "metric": self.metric.as_str(),
            "group_policy": match self.group_policy {
                GroupPolicy::Explicit => "explicit",
                GroupPolicy::KeywordSniff => "keywords",
            },
            "refresh_enabled": self.refresh_enabled,
            "refresh_interval_secs": self.refresh_interval_secs,
        })
        .to_string()
    }

    /// Stable hash of the effective configuration, for log correlation.
    pub fn config_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.to_json().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Lifecycle of one load cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPhase {
    #[default]
    Idle,
    Loading,
    Ready,
    Failed,
}

/// All mutable session state. Mutated only through the transition methods.
#[derive(Debug)]
pub struct SessionState {
    pub phase: LoadPhase,
    pub collection: Option<IndexDocument>,
    pub index_error: Option<String>,
    pub summaries: HashMap<String, SummaryDocument>,
    pub summary_inline: bool,
    pub summary_error: Option<String>,
    pub selected_run_id: Option<String>,
    pub status_filter: String,
    pub group_filter: String,
    pub refreshing: bool,
    pub refresh_error: Option<String>,
    pub last_refresh: Option<String>,
    /// Bumped by every `load_start`; in-flight work from an older generation
    /// must not apply its results.
    pub generation: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: LoadPhase::Idle,
            collection: None,
            index_error: None,
            summaries: HashMap::new(),
            summary_inline: false,
            summary_error: None,
            selected_run_id: None,
            status_filter: ALL_FILTER.to_string(),
            group_filter: ALL_FILTER.to_string(),
            refreshing: false,
            refresh_error: None,
            last_refresh: None,
            generation: 0,
        }
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl SessionState {
    pub fn runs(&self) -> &[RunRecord] {
        self.collection.as_ref().map(|c| c.runs.as_slice()).unwrap_or(&[])
    }

    /// Runs visible under the current status and group filters.
    pub fn filtered_runs(&self, policy: GroupPolicy) -> Vec<&RunRecord> {
        self.runs()
            .iter()
            .filter(|run| {
                let status_match = self.status_filter == ALL_FILTER
                    || run.status.as_deref() == Some(self.status_filter.as_str());
                let group_match = self.group_filter == ALL_FILTER
                    || group_key(run, policy) == self.group_filter;
                status_match && group_match
            })
            .collect()
    }

    /// Selected run, if it is still visible.
    pub fn selected_run(&self, policy: GroupPolicy) -> Option<&RunRecord> {
        let selected = self.selected_run_id.as_deref()?;
        self.filtered_runs(policy)
            .into_iter()
            .find(|run| run.run_id == selected)
    }

    pub fn summary_for(&self, run_id: &str) -> Option<&SummaryDocument> {
        self.summaries.get(run_id)
    }

    // -------------------------------------------------------------------------
    // Named transitions
    // -------------------------------------------------------------------------

    /// `idle/ready/failed -> loading`. Tears down displayed data and returns
    /// the new load generation.
    pub fn load_start(&mut self) -> u64 {
        self.generation += 1;
        self.phase = LoadPhase::Loading;
        self.collection = None;
        self.index_error = None;
        self.summaries.clear();
        self.summary_inline = false;
        self.summary_error = None;
        self.selected_run_id = None;
        self.status_filter = ALL_FILTER.to_string();
        self.group_filter = ALL_FILTER.to_string();
        self.refresh_error = None;
        log(
            Level::Info,
            Domain::Session,
            "load_start",
            obj(&[("generation", v_num(self.generation as f64))]),
        );
        self.generation
    }

    /// `loading -> ready`. Installs the merged collection and inline
    /// summaries, then revalidates filters and selection.
    pub fn load_success(
        &mut self,
        merged: IndexDocument,
        summaries: Vec<(String, SummaryDocument)>,
        summary_inline: bool,
        policy: GroupPolicy,
    ) {
        self.phase = LoadPhase::Ready;
        self.collection = Some(merged);
        self.summaries = summaries.into_iter().collect();
        self.summary_inline = summary_inline;
        self.last_refresh = Some(now_iso());
        self.revalidate_filters(policy);
        self.sync_selection(policy);
        log(
            Level::Info,
            Domain::Session,
            "load_success",
            obj(&[
                ("runs", v_num(self.runs().len() as f64)),
                ("inline_summaries", v_num(self.summaries.len() as f64)),
            ]),
        );
    }

    /// `loading -> failed`. No stale display: everything goes.
    pub fn load_error(&mut self, message: String) {
        self.phase = LoadPhase::Failed;
        self.collection = None;
        self.summaries.clear();
        self.summary_inline = false;
        self.selected_run_id = None;
        self.last_refresh = None;
        log(
            Level::Error,
            Domain::Session,
            "load_error",
            obj(&[("error", v_str(&message))]),
        );
        self.index_error = Some(message);
    }

    /// Marks a refresh cycle as in flight. Returns false when one already
    /// is; the caller must then treat the tick as a no-op.
    pub fn refresh_start(&mut self) -> bool {
        if self.refreshing || self.phase == LoadPhase::Loading {
            return false;
        }
        self.refreshing = true;
        self.refresh_error = None;
        true
    }

    /// Refresh landed: replace the collection wholesale, rebuild the summary
    /// cache, but preserve selection and filters across the swap.
    pub fn refresh_success(
        &mut self,
        merged: IndexDocument,
        summaries: Vec<(String, SummaryDocument)>,
        summary_inline: bool,
        policy: GroupPolicy,
    ) {
        self.phase = LoadPhase::Ready;
        self.collection = Some(merged);
        self.index_error = None;
        self.summaries = summaries.into_iter().collect();
        self.summary_inline = summary_inline;
        self.summary_error = None;
        self.last_refresh = Some(now_iso());
        self.refreshing = false;
        self.revalidate_filters(policy);
        self.sync_selection(policy);
        log(
            Level::Info,
            Domain::Refresh,
            "refresh_success",
            obj(&[("runs", v_num(self.runs().len() as f64))]),
        );
    }

    /// Refresh failed: last-good collection stays, the failure is a
    /// transient status message only.
    pub fn refresh_error(&mut self, message: String) {
        self.refreshing = false;
        log(
            Level::Warn,
            Domain::Refresh,
            "refresh_error",
            obj(&[("error", v_str(&message))]),
        );
        self.refresh_error = Some(message);
    }

    /// Select a run; clears any stale per-run summary error.
    pub fn select_run(&mut self, run_id: &str) {
        self.selected_run_id = Some(run_id.to_string());
        self.summary_error = None;
    }

    pub fn set_status_filter(&mut self, value: &str, policy: GroupPolicy) {
        self.status_filter = value.to_string();
        self.sync_selection(policy);
    }

    pub fn set_group_filter(&mut self, value: &str, policy: GroupPolicy) {
        self.group_filter = value.to_string();
        self.sync_selection(policy);
    }

    /// Filters referencing values that vanished from the collection fall
    /// back to the `all` sentinel.
    fn revalidate_filters(&mut self, policy: GroupPolicy) {
        if !status_filter_options(self.runs()).contains(&self.status_filter) {
            self.status_filter = ALL_FILTER.to_string();
        }
        if !group_filter_options(self.runs(), policy).contains(&self.group_filter) {
            self.group_filter = ALL_FILTER.to_string();
        }
    }

    /// Selection follows the filtered list: dropped when the list is empty,
    /// snapped to the first visible run when it fell outside the filter.
    fn sync_selection(&mut self, policy: GroupPolicy) {
        let visible: Vec<&str> = self
            .filtered_runs(policy)
            .into_iter()
            .map(|run| run.run_id.as_str())
            .collect();
        if visible.is_empty() {
            self.selected_run_id = None;
            return;
        }
        let still_visible = self
            .selected_run_id
            .as_deref()
            .is_some_and(|id| visible.contains(&id));
        if !still_visible {
            self.selected_run_id = Some(visible[0].to_string());
        }
    }
}

/// The controller: sources plus state, driven from one task.
pub struct Session {
    pub cfg: Config,
    pub state: SessionState,
    sources: Vec<Box<dyn IndexSource + Send + Sync>>,
}

impl Session {
    pub fn new(cfg: Config) -> Result<Self> {
        let mut sources = Vec::with_capacity(cfg.sources.len());
        for spec in &cfg.sources {
            sources.push(build_source(spec, cfg.retry.clone())?);
        }
        Ok(Self {
            cfg,
            state: SessionState::default(),
            sources,
        })
    }

    /// Build a session over pre-constructed sources (fixtures, tests).
    pub fn with_sources(cfg: Config, sources: Vec<Box<dyn IndexSource + Send + Sync>>) -> Self {
        Self {
            cfg,
            state: SessionState::default(),
            sources,
        }
    }

    /// Refresh needs at least one source that can be re-polled.
    pub fn can_refresh(&self) -> bool {
        self.sources.iter().any(|s| s.refreshable())
    }

    async fn fetch_all(&self) -> Vec<Result<FetchedIndex>> {
        join_all(self.sources.iter().map(|s| s.fetch_index())).await
    }

    /// Full load cycle: fetch every source concurrently, wait for all to
    /// settle, merge, install. Fails only when every source failed.
    pub async fn load(&mut self) -> Result<()> {
        let generation = self.state.load_start();
        let results = self.fetch_all().await;
        if generation != self.state.generation {
            return Ok(()); // superseded by a newer load
        }

        let (fetches, summaries, summary_inline) = split_fetches(results);
        match merge_fetches(fetches) {
            Ok(merged) => {
                self.state
                    .load_success(merged, summaries, summary_inline, self.cfg.group_policy);
                self.prefetch_running().await;
                Ok(())
            }
            Err(err) => {
                self.state.load_error(err.to_string());
                Err(err)
            }
        }
    }

    /// One refresh cycle. A tick while another refresh (or a load) is in
    /// flight is a no-op; a failed refresh leaves the last-good collection.
    pub async fn refresh(&mut self) {
        if !self.can_refresh() || !self.state.refresh_start() {
            return;
        }
        let generation = self.state.generation;
        let results = self.fetch_all().await;
        if generation != self.state.generation {
            self.state.refreshing = false;
            return; // a full load superseded this refresh
        }

        let (fetches, summaries, summary_inline) = split_fetches(results);
        match merge_fetches(fetches) {
            Ok(merged) => {
                self.state
                    .refresh_success(merged, summaries, summary_inline, self.cfg.group_policy);
                self.prefetch_running().await;
            }
            Err(err) => self.state.refresh_error(err.to_string()),
        }
    }

    /// Load the summary for one run into the cache. Missing paths and fetch
    /// failures surface as the per-run summary error, nothing more.
    pub async fn load_summary_for(&mut self, run_id: &str) {
        self.state.summary_error = None;
        if self.state.summaries.contains_key(run_id) {
            return;
        }
        let Some(run) = self.state.runs().iter().find(|r| r.run_id == run_id).cloned() else {
            return;
        };

        let path = run
            .summary_path
            .clone()
            .filter(|p| !p.is_empty());
        let Some(path) = path else {
            self.state.summary_error = Some(if self.state.summary_inline {
                "summary not loaded for this run".to_string()
            } else {
                "missing summary path for this run".to_string()
            });
            return;
        };

        let source = self.source_for(run.summary_base_url.as_deref());
        let Some(source) = source else {
            self.state.summary_error = Some("no source available for this summary".to_string());
            return;
        };
        match source.fetch_summary(&path).await {
            Ok(summary) => {
                log(
                    Level::Debug,
                    Domain::Summary,
                    "summary_loaded",
                    obj(&[("run_id", v_str(run_id))]),
                );
                self.state.summaries.insert(run_id.to_string(), summary);
            }
            Err(err) => {
                self.state.summary_error = Some(err.to_string());
            }
        }
    }

    /// Load the summary for the currently selected run, if any.
    pub async fn load_selected_summary(&mut self) {
        if let Some(run_id) = self.state.selected_run_id.clone() {
            self.load_summary_for(&run_id).await;
        }
    }

    /// Background prefetch of summaries for every `running` run. Failures
    /// are swallowed; an absent cache entry is their only trace.
    async fn prefetch_running(&mut self) {
        let targets: Vec<(String, String, Option<String>)> = self
            .state
            .runs()
            .iter()
            .filter(|run| run.status.as_deref() == Some("running"))
            .filter(|run| !self.state.summaries.contains_key(&run.run_id))
            .filter_map(|run| {
                run.summary_path
                    .clone()
                    .filter(|p| !p.is_empty())
                    .map(|path| (run.run_id.clone(), path, run.summary_base_url.clone()))
            })
            .collect();
        if targets.is_empty() {
            return;
        }

        let fetches = targets.iter().map(|(run_id, path, base)| {
            let source = self.source_for(base.as_deref());
            async move {
                match source {
                    Some(source) => (run_id.clone(), source.fetch_summary(path).await.ok()),
                    None => (run_id.clone(), None),
                }
            }
        });
        let results = join_all(fetches).await;

        let mut loaded = 0usize;
        for (run_id, summary) in results {
            if let Some(summary) = summary {
                self.state.summaries.insert(run_id, summary);
                loaded += 1;
            }
        }
        json_log(
            "summary_prefetch",
            obj(&[
                ("targets", v_num(targets.len() as f64)),
                ("loaded", v_num(loaded as f64)),
                ("silent", v_bool(true)),
            ]),
        );
    }

    /// The source owning a summary base, falling back to the first source
    /// when the base is unknown (single-source sessions).
    fn source_for(&self, base: Option<&str>) -> Option<&(dyn IndexSource + Send + Sync)> {
        let by_base = base.and_then(|base| {
            self.sources
                .iter()
                .find(|s| s.location() == base)
                .map(|s| s.as_ref())
        });
        by_base.or_else(|| self.sources.first().map(|s| s.as_ref()))
    }
}

fn split_fetches(
    results: Vec<Result<FetchedIndex>>,
) -> (Vec<Result<SourceDocument>>, Vec<(String, SummaryDocument)>, bool) {
    let mut summaries = Vec::new();
    let mut summary_inline = false;
    let fetches = results
        .into_iter()
        .map(|result| {
            result.map(|fetched| {
                summary_inline = summary_inline || fetched.summary_inline;
                summaries.extend(fetched.summaries);
                SourceDocument {
                    location: fetched.location,
                    document: fetched.document,
                }
            })
        })
        .collect();
    (fetches, summaries, summary_inline)
}

/// Auto-refresh timer: a cancellable task owned by the controller loop.
/// Ticks are delivered over a bounded channel; whatever arrives while a
/// refresh is still in flight is dropped rather than queued up.
pub struct RefreshTimer {
    handle: JoinHandle<()>,
    ticks: mpsc::Receiver<u64>,
}

impl RefreshTimer {
    pub fn start(period: Duration) -> Self {
        let (tx, ticks) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer.tick().await; // swallow the immediate first tick
            let mut n = 0u64;
            loop {
                timer.tick().await;
                n += 1;
                if tx.is_closed() {
                    break;
                }
                let _ = tx.try_send(n); // full channel: receiver busy, drop the tick
            }
        });
        Self { handle, ticks }
    }

    /// Next tick, or `None` once the timer is stopped.
    pub async fn tick(&mut self) -> Option<u64> {
        self.ticks.recv().await
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
