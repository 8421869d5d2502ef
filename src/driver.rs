//! The step loop: ask the planner, apply the action, consult the detector.

use crate::brain::Planner;
use crate::capability::PageCapability;
use crate::capture::{self, CaptureOutcome, DocumentFetcher};
use crate::detector::{CompletionDetector, StopReason, Verdict, looks_like_document};
use crate::error::{PageError, RunError};
use crate::face::{self, AgentEvent, EventSender};
use crate::sink::DownloadSink;
use crate::types::{AgentAction, AgentStep, CAPTURE_PDF_TAB, DOWNLOAD_PDF, PageState};
use crate::usage::TokenUsage;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Terminal states of one driver run. `Running` is implicit while `run` is
/// on the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Succeeded(StopReason),
    BudgetExhausted { cap: usize },
    Failed(RunError),
}

#[derive(Debug, Clone)]
pub struct DriverOutcome {
    pub state: RunState,
    pub steps: Vec<AgentStep>,
    pub planner_calls: usize,
    pub usage: TokenUsage,
}

impl DriverOutcome {
    pub fn steps_taken(&self) -> usize {
        self.steps.len()
    }
}

pub struct AgentDriver {
    planner: Box<dyn Planner>,
    fetcher: Arc<dyn DocumentFetcher>,
    post_action_wait: Duration,
    read_only: bool,
    cancel: CancellationToken,
    events: Option<EventSender>,
}

impl AgentDriver {
    pub fn new(planner: Box<dyn Planner>, fetcher: Arc<dyn DocumentFetcher>) -> Self {
        Self {
            planner,
            fetcher,
            post_action_wait: Duration::ZERO,
            read_only: false,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    /// Pause after actions that may start a download, so browser events can
    /// land before the detector runs.
    pub fn with_post_action_wait(mut self, wait: Duration) -> Self {
        self.post_action_wait = wait;
        self
    }

    /// Reject every action that could change the page (scout pass).
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
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

    /// Drive the planner against `page` until the detector stops the run,
    /// `step_cap` steps have executed, or a step fails.
    pub async fn run(
        &mut self,
        task: &str,
        page: &mut dyn PageCapability,
        sink: &mut DownloadSink,
        detector: &mut CompletionDetector,
        step_cap: usize,
    ) -> DriverOutcome {
        let mut steps = Vec::new();
        let mut planner_calls = 0;
        let state = self
            .drive(task, page, sink, detector, step_cap, &mut steps, &mut planner_calls)
            .await;

        match &state {
            RunState::Succeeded(reason) => {
                info!(steps = steps.len(), reason = ?reason, "run stopped");
                self.emit(AgentEvent::TaskComplete {
                    summary: match reason {
                        StopReason::Declared(m) => m.clone(),
                        StopReason::TargetReached(n) => format!("{n} artifact(s) downloaded"),
                    },
                });
            }
            RunState::BudgetExhausted { cap } => {
                warn!(cap, "step budget exhausted");
                self.emit(AgentEvent::TaskError {
                    message: format!("Reached maximum step limit ({cap})"),
                });
            }
            RunState::Failed(e) => {
                warn!(steps = steps.len(), error = %e, "run failed");
                self.emit(AgentEvent::TaskError { message: e.to_string() });
            }
        }

        DriverOutcome {
            state,
            steps,
            planner_calls,
            usage: self.planner.usage(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &mut self,
        task: &str,
        page: &mut dyn PageCapability,
        sink: &mut DownloadSink,
        detector: &mut CompletionDetector,
        step_cap: usize,
        steps: &mut Vec<AgentStep>,
        planner_calls: &mut usize,
    ) -> RunState {
        self.planner.start_task(task);

        match page.observe().await {
            Ok(initial) => self.planner.observe(&initial),
            Err(e) if e.halts_run() => return RunState::Failed(RunError::Capability(e.to_string())),
            Err(e) => self.planner.observe(&PageState {
                error: Some(e.to_string()),
                ..Default::default()
            }),
        }

        loop {
            if steps.len() >= step_cap {
                return RunState::BudgetExhausted { cap: step_cap };
            }
            if self.cancel.is_cancelled() {
                return RunState::Failed(RunError::Cancelled);
            }

            debug!(step = steps.len() + 1, "asking planner for next action");
            self.emit(AgentEvent::Thinking);
            let cancel = self.cancel.clone();
            let decided = tokio::select! {
                _ = cancel.cancelled() => return RunState::Failed(RunError::Cancelled),
                r = self.planner.next_action() => r,
            };
            *planner_calls += 1;

            let action = match decided {
                Ok(a) => a,
                Err(e) => return RunState::Failed(RunError::Planner(e.to_string())),
            };

            let index = steps.len() + 1;
            info!(step = index, action = %action.describe(), "executing");
            self.emit(AgentEvent::Step {
                number: index,
                description: action.describe(),
            });

            let mut notes = Vec::new();
            let mut step_error = None;
            match self.apply(&action, page, sink, &mut notes).await {
                Ok(()) => {}
                Err(e) if !e.halts_run() => {
                    debug!(step = index, error = %e, "action not applicable");
                    self.emit(AgentEvent::StepError { message: e.to_string() });
                    step_error = Some(e.to_string());
                }
                Err(e) => {
                    steps.push(AgentStep {
                        index,
                        action,
                        observed_url_after: page.current_url().await.unwrap_or_default(),
                    });
                    return RunState::Failed(RunError::Capability(e.to_string()));
                }
            }

            if action.may_trigger_download() && !self.post_action_wait.is_zero() {
                tokio::time::sleep(self.post_action_wait).await;
            }
            sink.drain();

            let mut state = match page.observe().await {
                Ok(s) => s,
                Err(e) if e.halts_run() => {
                    steps.push(AgentStep {
                        index,
                        action,
                        observed_url_after: String::new(),
                    });
                    return RunState::Failed(RunError::Capability(e.to_string()));
                }
                Err(e) => PageState {
                    error: Some(e.to_string()),
                    ..Default::default()
                },
            };
            state.notes = notes;
            if step_error.is_some() {
                state.error = step_error;
            }
            steps.push(AgentStep {
                index,
                action: action.clone(),
                observed_url_after: state.url.clone(),
            });

            loop {
                match detector.evaluate(&action, &state, sink) {
                    Verdict::Stop(reason) => return RunState::Succeeded(reason),
                    Verdict::Capture(tab) => {
                        let outcome = capture::capture_from_tab(page, self.fetcher.as_ref(), sink, &tab).await;
                        self.report_capture(&outcome);
                        sink.drain();
                        if let Ok(fresh) = page.observe().await {
                            let notes = std::mem::take(&mut state.notes);
                            let error = state.error.take();
                            state = PageState { notes, error, ..fresh };
                        }
                        state.notes.push(outcome.note(&tab.url));
                    }
                    Verdict::Continue => break,
                }
            }

            self.planner.observe(&state);
        }
    }

    async fn apply(
        &mut self,
        action: &AgentAction,
        page: &mut dyn PageCapability,
        sink: &mut DownloadSink,
        notes: &mut Vec<String>,
    ) -> Result<(), PageError> {
        if self.read_only && !action.is_read_only() {
            return Err(PageError::NotApplicable(format!(
                "{} is not allowed in a read-only pass",
                action.describe()
            )));
        }

        match action {
            AgentAction::Navigate { url } => page.navigate(url).await,
            AgentAction::Click { target } => page.click(target).await,
            AgentAction::FillField { target, value } => page.fill(target, value).await,
            AgentAction::SelectOption { target, option } => page.select(target, option).await,
            AgentAction::SwitchTab { handle } => page.switch_tab(handle).await,
            AgentAction::CloseTab { handle } => page.close_tab(handle).await,
            AgentAction::InvokeCustomAction { name, args } => {
                let note = self.custom_action(name, args, page, sink).await?;
                notes.push(note);
                Ok(())
            }
            AgentAction::DeclareDone { .. } => Ok(()),
        }
    }

    async fn custom_action(
        &mut self,
        name: &str,
        args: &serde_json::Value,
        page: &mut dyn PageCapability,
        sink: &mut DownloadSink,
    ) -> Result<String, PageError> {
        match name {
            CAPTURE_PDF_TAB => {
                let tabs = page.list_tabs().await?;
                let tab = tabs
                    .iter()
                    .filter(|t| looks_like_document(&t.url) && !sink.is_known_url(&t.url))
                    .max_by_key(|t| t.active)
                    .cloned()
                    .ok_or_else(|| PageError::NotApplicable("no open tab shows a PDF".into()))?;
                let outcome = capture::capture_from_tab(page, self.fetcher.as_ref(), sink, &tab).await;
                self.report_capture(&outcome);
                Ok(outcome.note(&tab.url))
            }
            DOWNLOAD_PDF => {
                let current = page.current_url().await?;
                let url = args
                    .get("url")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| current.clone());
                let outcome = capture::capture_url(page, self.fetcher.as_ref(), sink, &url, Some(&current)).await;
                self.report_capture(&outcome);
                Ok(outcome.note(&url))
            }
            other => Err(PageError::NotApplicable(format!("unknown custom action '{other}'"))),
        }
    }

    fn report_capture(&self, outcome: &CaptureOutcome) {
        match outcome {
            CaptureOutcome::Captured(event) => self.emit(AgentEvent::Artifact {
                name: event.suggested_name.clone(),
                bytes: event.byte_size,
            }),
            CaptureOutcome::Failed(why) | CaptureOutcome::NotDocument(why) => {
                self.emit(AgentEvent::StepError { message: why.clone() })
            }
            CaptureOutcome::Duplicate => {}
        }
    }

    fn emit(&self, event: AgentEvent) {
        face::emit(self.events.as_ref(), event);
    }
}
