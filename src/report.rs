//! Batch summary: the table printed at the end of a run and its JSON copy.

use crate::history::now_rfc3339;
use crate::orchestrator::RunResult;
use crate::usage::TokenSummary;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub generated_at: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub partial: usize,
    /// Work items per strategy name.
    pub strategies: BTreeMap<String, usize>,
    pub total_files: usize,
    pub total_secs: f64,
    pub avg_secs_per_file: Option<f64>,
    pub tokens: TokenSummary,
    pub results: Vec<RunResult>,
}

impl BatchReport {
    pub fn new(results: Vec<RunResult>) -> Self {
        let mut strategies = BTreeMap::new();
        let mut tokens = TokenSummary::default();
        for r in &results {
            let name = r.strategy_used.map(|s| s.to_string()).unwrap_or_else(|| "none".into());
            *strategies.entry(name).or_insert(0) += 1;
            tokens.merge(&r.tokens);
        }
        let skipped = results.iter().filter(|r| r.is_skipped()).count();
        let succeeded = results.iter().filter(|r| r.success).count();
        let total_files = results.iter().map(|r| r.artifact_paths.len()).sum();
        let total_secs: f64 = results.iter().map(|r| r.elapsed_secs).sum();

        Self {
            generated_at: now_rfc3339(),
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded - skipped,
            skipped,
            partial: results.iter().filter(|r| r.partial).count(),
            strategies,
            total_files,
            total_secs,
            avg_secs_per_file: (total_files > 0).then(|| total_secs / total_files as f64),
            tokens,
            results,
        }
    }

    pub fn any_succeeded(&self) -> bool {
        self.succeeded > 0
    }

    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(78);
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "OM HARVEST SUMMARY");
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(
            out,
            "{:<44} {:<10} {:<8} {:>5}  {}",
            "URL", "STRATEGY", "STATUS", "FILES", "DETAIL"
        );
        for r in &self.results {
            let status = match (r.success, r.skipped, r.partial) {
                (_, Some(_), _) => "skipped",
                (true, _, true) => "partial",
                (true, _, false) => "ok",
                (false, _, _) => "failed",
            };
            let detail = match (&r.error, r.skipped) {
                (Some(e), _) => e.to_string(),
                (None, Some(reason)) => format!("{reason:?}"),
                (None, None) => r
                    .artifact_paths
                    .iter()
                    .filter_map(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(", "),
            };
            let strategy = r.strategy_used.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
            let _ = writeln!(
                out,
                "{:<44} {:<10} {:<8} {:>5}  {}",
                ellipsize(&r.work_item.target_url, 44),
                strategy,
                status,
                r.artifact_paths.len(),
                detail
            );
        }
        let _ = writeln!(out, "{}", "-".repeat(78));
        let _ = writeln!(
            out,
            "succeeded {} | failed {} | skipped {} | partial {} | total {}",
            self.succeeded, self.failed, self.skipped, self.partial, self.total
        );
        let strategies: Vec<String> = self.strategies.iter().map(|(k, v)| format!("{k}: {v}")).collect();
        let _ = writeln!(out, "strategies: {}", strategies.join(", "));
        let _ = write!(out, "files {} | time {:.1}s", self.total_files, self.total_secs);
        if let Some(avg) = self.avg_secs_per_file {
            let _ = write!(out, " | {avg:.1}s per file");
        }
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "tokens {} (scout {}, main {}) | cost ${:.4} ({})",
            self.tokens.total.tokens.total(),
            self.tokens.scout.tokens.total(),
            self.tokens.main.tokens.total(),
            self.tokens.total.cost,
            if self.tokens.model.is_empty() { "-" } else { self.tokens.model.as_str() }
        );
        out
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing report {}", path.display()))?;
        Ok(())
    }
}

fn ellipsize(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{head}...")
}
