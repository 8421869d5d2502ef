//! One work item per target URL: scout, pick a strategy, drive, collect.

use crate::brain::PlannerFactory;
use crate::capability::{CapabilityFactory, ContextSpec, ScopedContext};
use crate::capture::DocumentFetcher;
use crate::config::{self, Config, Pricing};
use crate::detector::{CompletionDetector, StopReason};
use crate::driver::{AgentDriver, RunState};
use crate::error::RunError;
use crate::face::{self, AgentEvent, EventSender};
use crate::history::artifact_id;
use crate::scout::{ScoutEstimate, ScoutEstimator};
use crate::sink::{self, DirectoryWatch, DownloadEvent, DownloadSink};
use crate::strategy::{self, StepCaps, Strategy};
use crate::usage::{PlannerRole, TokenLedger, TokenSummary};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub target_url: String,
    pub domain_key: String,
    /// Domain bucket the artifacts land in.
    pub bucket: PathBuf,
    /// Files already in the bucket before the run.
    pub existing_artifacts: BTreeSet<PathBuf>,
}

impl WorkItem {
    pub fn new(target_url: &str, downloads_root: &Path) -> Self {
        let domain_key = sink::domain_key(target_url);
        let bucket = downloads_root.join(&domain_key);
        let existing_artifacts = sink::list_files(&bucket).into_iter().collect();
        Self {
            target_url: target_url.trim().trim_start_matches('@').to_string(),
            domain_key,
            bucket,
            existing_artifacts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The scout found nothing to download.
    NoAffordances,
    /// A previous invocation already harvested this target.
    AlreadyHarvested,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub work_item: WorkItem,
    pub scout: Option<ScoutEstimate>,
    pub strategy_used: Option<Strategy>,
    pub success: bool,
    pub skipped: Option<SkipReason>,
    /// Succeeded with fewer artifacts than the strategy expected.
    pub partial: bool,
    pub artifact_paths: BTreeSet<PathBuf>,
    pub downloads: Vec<DownloadEvent>,
    pub error: Option<RunError>,
    pub elapsed_secs: f64,
    pub steps_taken: usize,
    pub tokens: TokenSummary,
}

impl RunResult {
    fn new(work_item: WorkItem) -> Self {
        Self {
            work_item,
            scout: None,
            strategy_used: None,
            success: false,
            skipped: None,
            partial: false,
            artifact_paths: BTreeSet::new(),
            downloads: Vec::new(),
            error: None,
            elapsed_secs: 0.0,
            steps_taken: 0,
            tokens: TokenSummary::default(),
        }
    }

    fn failed(mut self, error: RunError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

/// Knobs the orchestrator takes from the configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub downloads_dir: PathBuf,
    pub caps: StepCaps,
    pub inter_item_delay: Duration,
    pub post_action_wait: Duration,
    pub settle_wait: Duration,
    pub contact: config::Contact,
    pub model: String,
    pub pricing: Pricing,
}

impl Settings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            downloads_dir: cfg.paths.downloads_dir.clone(),
            caps: StepCaps::from(&cfg.agent),
            inter_item_delay: cfg.timing.inter_item_delay(),
            post_action_wait: cfg.timing.post_action_wait(),
            settle_wait: cfg.timing.settle_wait(),
            contact: cfg.contact.clone(),
            model: cfg.agent.model.clone(),
            pricing: cfg.pricing.clone(),
        }
    }
}

pub struct Orchestrator {
    pages: Arc<dyn CapabilityFactory>,
    planners: Arc<dyn PlannerFactory>,
    fetcher: Arc<dyn DocumentFetcher>,
    settings: Settings,
    skip_ids: HashSet<String>,
    cancel: CancellationToken,
    events: Option<EventSender>,
}

impl Orchestrator {
    pub fn new(
        pages: Arc<dyn CapabilityFactory>,
        planners: Arc<dyn PlannerFactory>,
        fetcher: Arc<dyn DocumentFetcher>,
        settings: Settings,
    ) -> Self {
        Self {
            pages,
            planners,
            fetcher,
            settings,
            skip_ids: HashSet::new(),
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    /// Targets whose artifact id is in `ids` are skipped as already harvested.
    pub fn with_skip_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.skip_ids = ids.into_iter().collect();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: Option<EventSender>) -> Self {
        self.events = events;
        self
    }

    /// Process `urls` one after another, pausing between items. A failing
    /// item never stops the batch; cancellation marks the rest cancelled.
    pub async fn process_batch(&self, urls: &[String]) -> Vec<RunResult> {
        let mut results = Vec::with_capacity(urls.len());

        for (i, url) in urls.iter().enumerate() {
            if i > 0 && !self.cancel.is_cancelled() {
                info!(secs = self.settings.inter_item_delay.as_secs_f64(), "waiting before next target");
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.settings.inter_item_delay) => {}
                }
            }

            if self.cancel.is_cancelled() {
                let item = WorkItem::new(url, &self.settings.downloads_dir);
                results.push(RunResult::new(item).failed(RunError::Cancelled));
                continue;
            }

            self.emit(AgentEvent::WorkItemStarted {
                index: i + 1,
                total: urls.len(),
                url: url.clone(),
            });
            results.push(self.process(url).await);
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        info!(succeeded, total = results.len(), "batch finished");
        self.emit(AgentEvent::BatchFinished {
            succeeded,
            total: results.len(),
        });
        results
    }

    /// Run one target end to end. Every failure ends up in the result.
    pub async fn process(&self, url: &str) -> RunResult {
        let started = Instant::now();
        let item = WorkItem::new(url, &self.settings.downloads_dir);
        info!(url = %item.target_url, domain = %item.domain_key, "processing target");

        let mut ledger = TokenLedger::default();
        let mut result = self.run_item(item, &mut ledger).await;

        result.tokens = ledger.summary(&self.settings.model, &self.settings.pricing);
        result.elapsed_secs = started.elapsed().as_secs_f64();
        match (&result.error, result.skipped) {
            (_, Some(reason)) => info!(url = %url, reason = ?reason, "target skipped"),
            (Some(e), _) => warn!(url = %url, error = %e, "target failed"),
            (None, None) => info!(
                url = %url,
                files = result.artifact_paths.len(),
                partial = result.partial,
                "target harvested"
            ),
        }
        result
    }

    async fn run_item(&self, item: WorkItem, ledger: &mut TokenLedger) -> RunResult {
        let mut result = RunResult::new(item.clone());

        if self.skip_ids.contains(&artifact_id(&item.target_url)) {
            result.skipped = Some(SkipReason::AlreadyHarvested);
            return result;
        }
        if self.cancel.is_cancelled() {
            return result.failed(RunError::Cancelled);
        }

        let scout = ScoutEstimator::new(
            self.pages.clone(),
            self.planners.clone(),
            self.fetcher.clone(),
            self.settings.caps.scout,
        )
        .with_cancel(self.cancel.clone())
        .estimate(&item.target_url)
        .await;
        ledger.add(PlannerRole::Scout, scout.usage);

        let strategy = strategy::select(scout.estimate);
        result.scout = Some(scout.estimate);
        result.strategy_used = Some(strategy);
        info!(url = %item.target_url, estimate = ?scout.estimate, strategy = %strategy, "strategy selected");
        self.emit(AgentEvent::Strategy {
            url: item.target_url.clone(),
            strategy: strategy.to_string(),
        });

        let (Some(cap), Some(task)) = (
            strategy.step_cap(&self.settings.caps),
            strategy::task_description(strategy, &item.target_url, scout.estimate, &self.settings.contact),
        ) else {
            result.skipped = Some(SkipReason::NoAffordances);
            return result;
        };

        if self.cancel.is_cancelled() {
            return result.failed(RunError::Cancelled);
        }

        if let Err(e) = std::fs::create_dir_all(&item.bucket) {
            return result.failed(RunError::Storage(format!("{}: {e}", item.bucket.display())));
        }

        let spec = ContextSpec::harvest(item.domain_key.clone(), item.bucket.clone());
        let mut ctx = match ScopedContext::acquire(self.pages.as_ref(), &spec).await {
            Ok(ctx) => ctx,
            Err(e) => return result.failed(RunError::Capability(e.to_string())),
        };

        let mut sink = DownloadSink::new(item.bucket.clone());
        let mark = sink.mark();
        let tx = sink.subscribe();
        ctx.subscribe_downloads(tx);

        if let Err(e) = ctx.navigate(&item.target_url).await {
            if e.halts_run() {
                ctx.release().await;
                return result.failed(RunError::Capability(e.to_string()));
            }
        }
        let initial_tabs = ctx.list_tabs().await.unwrap_or_default();
        let mut detector = CompletionDetector::new(strategy.expected_count(), mark, &initial_tabs);

        let mut driver = AgentDriver::new(self.planners.create(PlannerRole::Main), self.fetcher.clone())
            .with_post_action_wait(self.settings.post_action_wait)
            .with_cancel(self.cancel.clone())
            .with_events(self.events.clone());
        let outcome = driver.run(&task, &mut *ctx, &mut sink, &mut detector, cap).await;
        ledger.add(PlannerRole::Main, outcome.usage);
        result.steps_taken = outcome.steps_taken();

        // Downloads started by the last clicks may still be in flight.
        let target_reached = matches!(outcome.state, RunState::Succeeded(StopReason::TargetReached(_)));
        if !target_reached && !self.cancel.is_cancelled() && !self.settings.settle_wait.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.settings.settle_wait) => {}
            }
        }
        sink.drain();
        let baseline: Vec<PathBuf> = item
            .existing_artifacts
            .iter()
            .cloned()
            .chain(sink.artifact_paths())
            .collect();
        for event in DirectoryWatch::with_baseline(&item.bucket, baseline).poll() {
            sink.record(event);
        }
        ctx.release().await;

        let landed = sink.count_since(mark);
        let (success, partial, error) = judge(&outcome.state, landed, strategy.expected_count());
        result.success = success;
        result.partial = partial;
        result.error = error;
        result.downloads = sink.events().to_vec();
        result.artifact_paths = sink.artifact_paths();
        result
    }

    fn emit(&self, event: AgentEvent) {
        face::emit(self.events.as_ref(), event);
    }
}

/// Turn the driver's terminal state and the number of artifacts that landed
/// into (success, partial, error).
pub fn judge(state: &RunState, landed: usize, expected: usize) -> (bool, bool, Option<RunError>) {
    match state {
        RunState::Failed(e) => (false, false, Some(e.clone())),
        _ if landed > 0 => (true, landed < expected, None),
        RunState::Succeeded(StopReason::TargetReached(_)) => (true, false, None),
        RunState::Succeeded(StopReason::Declared(_)) => (false, false, Some(RunError::DownloadFailure)),
        RunState::BudgetExhausted { cap } => (false, false, Some(RunError::BudgetExhausted { cap: *cap })),
    }
}
