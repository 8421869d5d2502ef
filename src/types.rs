use serde::{Deserialize, Serialize};

/// A single atomic action the planner asks the agent to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentAction {
    Navigate {
        url: String,
    },
    Click {
        target: String,
    },
    FillField {
        target: String,
        value: String,
    },
    SelectOption {
        target: String,
        option: String,
    },
    SwitchTab {
        handle: String,
    },
    CloseTab {
        handle: String,
    },
    InvokeCustomAction {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    DeclareDone {
        message: String,
    },
}

impl AgentAction {
    /// Actions after which the browser may start a download on its own.
    pub fn may_trigger_download(&self) -> bool {
        matches!(
            self,
            AgentAction::Navigate { .. }
                | AgentAction::Click { .. }
                | AgentAction::SwitchTab { .. }
                | AgentAction::InvokeCustomAction { .. }
        )
    }

    /// Actions that only read the page. The scout pass is restricted to these.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            AgentAction::Navigate { .. }
                | AgentAction::SwitchTab { .. }
                | AgentAction::DeclareDone { .. }
        )
    }

    pub fn describe(&self) -> String {
        match self {
            AgentAction::Navigate { url } => format!("navigate to {url}"),
            AgentAction::Click { target } => format!("click {target}"),
            AgentAction::FillField { target, .. } => format!("fill {target}"),
            AgentAction::SelectOption { target, option } => format!("select '{option}' in {target}"),
            AgentAction::SwitchTab { handle } => format!("switch to tab {handle}"),
            AgentAction::CloseTab { handle } => format!("close tab {handle}"),
            AgentAction::InvokeCustomAction { name, .. } => format!("custom action {name}"),
            AgentAction::DeclareDone { message } => format!("done: {message}"),
        }
    }
}

/// One executed step of the driver loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    pub index: usize,
    pub action: AgentAction,
    pub observed_url_after: String,
}

/// A browser tab as seen by the agent. `handle` is the CDP target id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabInfo {
    pub handle: String,
    pub url: String,
    pub active: bool,
}

/// What the agent observes after executing a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub dom_snapshot: String,
    pub tabs: Vec<TabInfo>,
    /// Results of capture sub-actions run during the step.
    pub notes: Vec<String>,
    pub error: Option<String>,
}

/// A message in the conversation history sent to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Custom action: locate a tab showing a PDF and capture it.
pub const CAPTURE_PDF_TAB: &str = "capture_pdf_tab";
/// Custom action: fetch `args.url` (or the current page) as a PDF.
pub const DOWNLOAD_PDF: &str = "download_pdf";

pub const DOM_SNAPSHOT_MAX_CHARS: usize = 6000;
