//! The stop predicate consulted by the driver after every step.

use crate::sink::{DownloadSink, SinkMark};
use crate::types::{AgentAction, PageState, TabInfo};
use std::collections::HashSet;

/// Why a run stopped successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The planner declared the task complete.
    Declared(String),
    /// The sink holds as many new artifacts as the strategy expects.
    TargetReached(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// A tab shows a document: run the capture sub-action on it, then
    /// evaluate again.
    Capture(TabInfo),
    Stop(StopReason),
}

/// Composes the completion signals for one work item.
///
/// Priority within one evaluation: declared done, then the sink count, then
/// a document-like tab. Each (tab, location) pair is offered for capture at
/// most once.
#[derive(Debug, Clone)]
pub struct CompletionDetector {
    target: Option<usize>,
    mark: SinkMark,
    attempted: HashSet<(String, String)>,
}

impl CompletionDetector {
    /// `target_count` is 1 for the single workflow and the scouted count for
    /// a batch. Tabs open before the run are never treated as new.
    pub fn new(target_count: usize, mark: SinkMark, initial_tabs: &[TabInfo]) -> Self {
        Self {
            target: Some(target_count.max(1)),
            mark,
            attempted: initial_tabs.iter().map(|t| (t.handle.clone(), t.url.clone())).collect(),
        }
    }

    /// Only an explicit declaration stops the run. Used by the scout pass,
    /// which never captures anything.
    pub fn declared_only() -> Self {
        Self {
            target: None,
            mark: SinkMark::default(),
            attempted: HashSet::new(),
        }
    }

    pub fn target(&self) -> Option<usize> {
        self.target
    }

    pub fn evaluate(&mut self, last_action: &AgentAction, state: &PageState, sink: &DownloadSink) -> Verdict {
        if let AgentAction::DeclareDone { message } = last_action {
            return Verdict::Stop(StopReason::Declared(message.clone()));
        }

        let Some(target) = self.target else {
            return Verdict::Continue;
        };

        let landed = sink.count_since(self.mark);
        if landed >= target {
            return Verdict::Stop(StopReason::TargetReached(landed));
        }

        // Active tab first, so a PDF the planner is already looking at wins.
        let mut candidates: Vec<&TabInfo> = state.tabs.iter().filter(|t| t.active).collect();
        candidates.extend(state.tabs.iter().filter(|t| !t.active));
        for tab in candidates {
            if !looks_like_document(&tab.url) || sink.is_known_url(&tab.url) {
                continue;
            }
            if self.attempted.insert((tab.handle.clone(), tab.url.clone())) {
                return Verdict::Capture(tab.clone());
            }
        }

        Verdict::Continue
    }
}

/// Whether a tab location looks like a document rather than a web page.
pub fn looks_like_document(url: &str) -> bool {
    let lower = url.trim().to_lowercase();
    if lower.is_empty() || lower.starts_with("about:") || lower.starts_with("chrome") {
        return false;
    }
    let path = lower.split(['?', '#']).next().unwrap_or(&lower);
    path.ends_with(".pdf")
        || lower.contains("pdf")
        || lower.starts_with("blob:")
        || lower.contains("/uploads/")
        || lower.contains("wp-content")
}
