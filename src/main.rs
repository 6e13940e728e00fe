use anyhow::Result;
use serde_json::Value;
use tokio::time::Duration;

use runboard::logging::{json_log, obj, v_bool, v_num, v_str};
use runboard::resolve::{
    best_by_group, best_overall, group_filter_options, metric_delta, selected_metric,
    status_filter_options,
};
use runboard::schema::status_label;
use runboard::session::{Config, LoadPhase, RefreshTimer, Session};

fn v_opt_num(value: Option<f64>) -> Value {
    value.map_or(Value::Null, |v| serde_json::json!(v))
}

/// Emit the derived views for the current collection: option sets, best run
/// per group, best overall, and deltas against the baseline pointers.
fn report(session: &Session) {
    let cfg = &session.cfg;
    let state = &session.state;
    let runs = state.runs();

    json_log(
        "collection",
        obj(&[
            ("runs", v_num(runs.len() as f64)),
            (
                "generated_at",
                state
                    .collection
                    .as_ref()
                    .and_then(|c| c.generated_at.as_deref())
                    .map_or(Value::Null, v_str),
            ),
            (
                "status_options",
                v_str(&status_filter_options(runs).join(",")),
            ),
            (
                "group_options",
                v_str(&group_filter_options(runs, cfg.group_policy).join(",")),
            ),
            (
                "selected",
                state.selected_run_id.as_deref().map_or(Value::Null, v_str),
            ),
        ]),
    );

    if let Some(run) = state.selected_run(cfg.group_policy) {
        json_log(
            "selected_run",
            obj(&[
                ("run_id", v_str(&run.run_id)),
                ("display_name", v_str(run.display_label())),
                ("status", v_str(&status_label(run.effective_status()))),
                (
                    "summary_cached",
                    v_bool(state.summary_for(&run.run_id).is_some()),
                ),
            ]),
        );
    }

    for best in best_by_group(runs, cfg.group_policy, cfg.metric) {
        json_log(
            "group_best",
            obj(&[
                ("group", v_str(&best.label)),
                ("run_id", v_str(&best.run.run_id)),
                ("runs", v_num(best.count as f64)),
                ("metric", v_opt_num(selected_metric(best.run, cfg.metric))),
            ]),
        );
    }

    let Some(best) = best_overall(runs, cfg.metric) else {
        return;
    };
    json_log(
        "overall_best",
        obj(&[
            ("run_id", v_str(&best.run_id)),
            ("display_name", v_str(best.display_label())),
            ("metric", v_opt_num(selected_metric(best, cfg.metric))),
        ]),
    );

    let Some(collection) = state.collection.as_ref() else {
        return;
    };
    for (kind, pointer) in [
        ("true_baseline", &collection.true_baseline_run_id),
        ("baseline_to_beat", &collection.baseline_to_beat_run_id),
    ] {
        let Some(run_id) = pointer.as_deref() else {
            continue;
        };
        let Some(baseline) = collection.run(run_id) else {
            json_log(
                "baseline",
                obj(&[("kind", v_str(kind)), ("run_id", v_str(run_id)), ("status", v_str("missing_run"))]),
            );
            continue;
        };
        json_log(
            "baseline",
            obj(&[
                ("kind", v_str(kind)),
                ("run_id", v_str(run_id)),
                ("metric", v_opt_num(selected_metric(baseline, cfg.metric))),
                (
                    "best_delta",
                    v_opt_num(metric_delta(best, baseline, cfg.metric)),
                ),
            ]),
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cfg = Config::from_env();
    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        // Positional args override the configured source list.
        cfg.sources = args;
    }

    json_log(
        "startup",
        obj(&[
            ("sources", v_num(cfg.sources.len() as f64)),
            ("metric", v_str(cfg.metric.as_str())),
            ("auto_refresh", v_bool(cfg.refresh_enabled)),
            ("refresh_secs", v_num(cfg.refresh_interval_secs as f64)),
            ("config_hash", v_str(&cfg.config_hash())),
        ]),
    );

    let mut session = Session::new(cfg.clone())?;
    let watching = cfg.refresh_enabled && session.can_refresh();

    match session.load().await {
        Ok(()) => {
            report(&session);
            session.load_selected_summary().await;
        }
        Err(err) => {
            if !watching {
                return Err(err);
            }
            // Keep watching: the next tick starts a fresh load cycle.
        }
    }

    if !watching {
        return Ok(());
    }

    let mut timer = RefreshTimer::start(Duration::from_secs(cfg.refresh_interval_secs.max(1)));
    while let Some(tick) = timer.tick().await {
        json_log("refresh_tick", obj(&[("n", v_num(tick as f64))]));
        if session.state.phase == LoadPhase::Failed {
            // A failed collection is torn down; retry with a fresh load.
            if session.load().await.is_ok() {
                report(&session);
            }
        } else {
            session.refresh().await;
            if session.state.refresh_error.is_none() {
                report(&session);
            }
        }
    }

    Ok(())
}
