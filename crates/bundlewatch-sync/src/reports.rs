//! Per-run report files under `reports/<run_id>/`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bundlewatch_core::{analyze, AuthenticityPolicy, BundleRecord};
use chrono::{DateTime, Utc};
use tokio::fs;

use crate::pipeline::RunSummary;

const BRIEF_TOP: usize = 10;

fn money(amount: i64, currency: &str) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{currency} {sign}{}.{:02}", abs / 100, abs % 100)
}

pub fn render_brief(
    summary: &RunSummary,
    records: &[BundleRecord],
    policy: &AuthenticityPolicy,
    now: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Bundle Brief\n");
    let _ = writeln!(out, "- Run ID: `{}`", summary.run_id);
    let _ = writeln!(out, "- Started: {}", summary.started_at);
    let _ = writeln!(out, "- Finished: {}", summary.finished_at);
    if let Some(d) = &summary.discovery {
        let _ = writeln!(
            out,
            "- Discovery: {} known, +{} / -{}, {} failed windows",
            d.total,
            d.added.len(),
            d.removed.len(),
            d.failed_windows
        );
    }
    let _ = writeln!(
        out,
        "- Fetch: {} ids, {} batches ({} throttled, {} failed)",
        summary.requested, summary.batches, summary.throttled_batches, summary.failed_batches
    );
    let _ = writeln!(
        out,
        "- Writes: {} stored, {} skipped, {} failed",
        summary.writes.stored, summary.writes.skipped, summary.writes.failed
    );
    if let Some(r) = &summary.rendering {
        let _ = writeln!(
            out,
            "- Rendering fallback: {} submitted, {} resolved, {} failed",
            r.submitted.len(),
            r.resolved,
            r.failed
        );
    }
    let stats = &summary.stats;
    let _ = writeln!(
        out,
        "- Catalogue: {} bundles, {} discounted, average discount {:.2}%\n",
        stats.total, stats.with_discount, stats.average_discount
    );

    let mut ranked: Vec<&BundleRecord> = records.iter().filter(|r| r.discount_percent() > 0).collect();
    ranked.sort_by(|a, b| b.discount_percent().cmp(&a.discount_percent()).then(a.id.cmp(&b.id)));

    let _ = writeln!(out, "## Top Discounts\n");
    if ranked.is_empty() {
        let _ = writeln!(out, "_No discounted bundles._");
    }
    for record in ranked.iter().take(BRIEF_TOP) {
        let Some(price) = &record.current_price else {
            continue;
        };
        let verdict = analyze(record, policy, now);
        let _ = writeln!(
            out,
            "- [{}]({}) -{}% {} (was {}), {} games: {}",
            record.name.as_deref().unwrap_or("unnamed"),
            record.url,
            price.discount_percent,
            money(price.final_amount, &price.currency_code),
            money(price.original_amount, &price.currency_code),
            record.games_count(),
            verdict.reason
        );
    }

    let suspicious: Vec<_> = ranked
        .iter()
        .filter_map(|r| analyze(r, policy, now).evidence.map(|e| (r, e)))
        .collect();
    if !suspicious.is_empty() {
        let _ = writeln!(out, "\n## Inflated Reference Prices\n");
        for (record, evidence) in suspicious {
            let _ = writeln!(
                out,
                "- {} (`{}`): claimed original {} is {}% above the regular average",
                record.name.as_deref().unwrap_or("unnamed"),
                record.id,
                evidence.claimed_original,
                evidence.inflation_percent
            );
        }
    }
    out
}

/// Writes `summary.json` and `brief.md`; returns the run directory.
pub async fn write_run_reports(
    reports_root: &Path,
    summary: &RunSummary,
    records: &[BundleRecord],
    policy: &AuthenticityPolicy,
) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;

    let brief = render_brief(summary, records, policy, summary.finished_at);
    fs::write(dir.join("brief.md"), brief)
        .await
        .context("writing brief.md")?;
    Ok(dir)
}

/// Markdown index of the newest `runs` report directories.
pub fn recent_runs_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("summary.json").is_file())
        .filter_map(|entry| {
            let path = entry.path();
            let raw = std::fs::read_to_string(path.join("summary.json")).ok()?;
            let summary: serde_json::Value = serde_json::from_str(&raw).ok()?;
            Some((path, summary))
        })
        .collect::<Vec<_>>();
    dirs.sort_by(|a, b| {
        let key = |v: &serde_json::Value| v.get("finished_at").and_then(|f| f.as_str()).unwrap_or("").to_string();
        key(&b.1).cmp(&key(&a.1))
    });

    let mut lines = vec!["# Recent Runs".to_string(), String::new()];
    for (path, summary) in dirs.into_iter().take(runs.max(1)) {
        let field = |name: &str| summary.get(name).cloned().unwrap_or(serde_json::Value::Null);
        let writes = field("writes");
        lines.push(format!("## Run `{}`", field("run_id").as_str().unwrap_or("unknown")));
        lines.push(format!("- finished: {}", field("finished_at").as_str().unwrap_or("unknown")));
        lines.push(format!("- requested: {}", field("requested")));
        lines.push(format!(
            "- stored: {}, skipped: {}, failed: {}",
            writes.get("stored").cloned().unwrap_or_default(),
            writes.get("skipped").cloned().unwrap_or_default(),
            writes.get("failed").cloned().unwrap_or_default()
        ));
        let brief = path.join("brief.md");
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
