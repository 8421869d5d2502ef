//! The scout pass: a short read-only look at the page that sizes the task.

use crate::brain::PlannerFactory;
use crate::capability::{CapabilityFactory, ContextSpec, ScopedContext};
use crate::capture::DocumentFetcher;
use crate::detector::{CompletionDetector, StopReason};
use crate::driver::{AgentDriver, RunState};
use crate::sink::DownloadSink;
use crate::usage::{PlannerRole, TokenUsage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "count", rename_all = "snake_case")]
pub enum ScoutEstimate {
    Count(u32),
    Unknown,
}

impl ScoutEstimate {
    /// Count used for strategy selection: `Unknown` counts as one.
    pub fn resolved_count(&self) -> u32 {
        match self {
            ScoutEstimate::Count(n) => *n,
            ScoutEstimate::Unknown => 1,
        }
    }
}

/// Read the first run of ASCII digits in the scout's answer.
///
/// "3", "I found 3 buttons" and "count: 12." all parse; an answer without
/// digits, or one too large for `u32`, is `Unknown`.
pub fn parse_count(answer: &str) -> ScoutEstimate {
    let digits: String = answer
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits
        .parse::<u32>()
        .map(ScoutEstimate::Count)
        .unwrap_or(ScoutEstimate::Unknown)
}

#[derive(Debug, Clone)]
pub struct ScoutReport {
    pub estimate: ScoutEstimate,
    pub usage: TokenUsage,
    pub steps_taken: usize,
}

impl ScoutReport {
    fn unknown(usage: TokenUsage, steps_taken: usize) -> Self {
        Self {
            estimate: ScoutEstimate::Unknown,
            usage,
            steps_taken,
        }
    }
}

pub struct ScoutEstimator {
    pages: Arc<dyn CapabilityFactory>,
    planners: Arc<dyn PlannerFactory>,
    fetcher: Arc<dyn DocumentFetcher>,
    step_cap: usize,
    cancel: CancellationToken,
}

impl ScoutEstimator {
    pub fn new(
        pages: Arc<dyn CapabilityFactory>,
        planners: Arc<dyn PlannerFactory>,
        fetcher: Arc<dyn DocumentFetcher>,
        step_cap: usize,
    ) -> Self {
        Self {
            pages,
            planners,
            fetcher,
            step_cap,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Count the document download affordances on `url` in a throwaway
    /// context. Never fails: every problem yields `Unknown`.
    pub async fn estimate(&self, url: &str) -> ScoutReport {
        let spec = ContextSpec::scout(format!("scout:{url}"));
        let mut ctx = match ScopedContext::acquire(self.pages.as_ref(), &spec).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(url = %url, error = %e, "scout context failed to open");
                return ScoutReport::unknown(TokenUsage::default(), 0);
            }
        };

        let report = self.explore(url, &mut ctx).await;
        ctx.release().await;

        info!(url = %url, estimate = ?report.estimate, steps = report.steps_taken, "scout finished");
        report
    }

    async fn explore(&self, url: &str, ctx: &mut ScopedContext) -> ScoutReport {
        if let Err(e) = ctx.navigate(url).await {
            warn!(url = %url, error = %e, "scout could not load the page");
            return ScoutReport::unknown(TokenUsage::default(), 0);
        }

        let planner = self.planners.create(PlannerRole::Scout);
        let mut driver = AgentDriver::new(planner, self.fetcher.clone())
            .read_only()
            .with_cancel(self.cancel.clone());
        // Downloads are denied in this context; the sink stays empty.
        let mut sink = DownloadSink::new(std::env::temp_dir().join("om-harvester-scout"));
        let mut detector = CompletionDetector::declared_only();

        let outcome = driver
            .run(&scout_task(url), &mut **ctx, &mut sink, &mut detector, self.step_cap)
            .await;

        let estimate = match &outcome.state {
            RunState::Succeeded(StopReason::Declared(answer)) => parse_count(answer),
            _ => ScoutEstimate::Unknown,
        };
        ScoutReport {
            estimate,
            usage: outcome.usage,
            steps_taken: outcome.steps_taken(),
        }
    }
}

fn scout_task(url: &str) -> String {
    format!(
        "Your ONLY task is to count offering memorandum download buttons on {url}, which is already open.\n\
         COUNT buttons or links for downloadable documents: \"View Package\", \"Download Package\", \
         \"Download Brochure\", \"Download OM\", \"Download Flyer\", \"Marketing Package\", \
         \"Offering Memorandum\", \"Investment Summary\", \"Lease Brochure\", links to PDF files.\n\
         DO NOT COUNT property cards, navigation links, social media links or general site buttons.\n\
         Do NOT click anything and do NOT leave this page. The DOM snapshot covers the whole page.\n\
         Answer with declare_done whose message is ONLY the number, for example {{\"action\":\"declare_done\",\"message\":\"2\"}}."
    )
}
