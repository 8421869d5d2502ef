use crate::config;
use crate::error::PlannerError;
use crate::types::{AgentAction, ChatMessage, PageState};
use crate::usage::{PlannerRole, TokenUsage};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = r#"You are a browser automation agent working on real-estate brokerage sites. You control a real Chrome browser by issuing ONE action at a time as JSON.

Available actions:
- {"action":"navigate","url":"https://..."}
- {"action":"click","target":"[e0]"}
- {"action":"fill_field","target":"[e3]","value":"John Doe"}
- {"action":"select_option","target":"[e5]","option":"California"}
- {"action":"switch_tab","handle":"<tab handle>"}
- {"action":"close_tab","handle":"<tab handle>"}
- {"action":"invoke_custom_action","name":"capture_pdf_tab","args":{}}
- {"action":"invoke_custom_action","name":"download_pdf","args":{"url":"https://.../file.pdf"}}
- {"action":"declare_done","message":"what was achieved"}

Rules:
1. Return ONLY a single JSON object per response. No markdown, no explanation.
2. Target elements with the [eN] ids from the DOM snapshot. Links show their href after "->".
3. Elements marked <doc?> look like document downloads.
4. If a PDF opens in a new tab, use capture_pdf_tab. If you see a direct PDF link, use download_pdf with its URL.
5. Never click the same download button twice. The system stops you as soon as a file arrives.
6. When the task is accomplished, or clearly impossible, use declare_done."#;

/// Most recent messages kept after the system prompt and task. Older
/// observations carry full DOM snapshots and are dropped first.
const RECENT_MESSAGES: usize = 24;

/// Times a reply that is not a JSON action is sent back for correction.
const REPAIR_ATTEMPTS: usize = 1;

/// The decision-making side of the agent: an LLM that picks the next action.
#[async_trait]
pub trait Planner: Send {
    /// Begin a task with a fresh conversation.
    fn start_task(&mut self, task: &str);

    /// Feed the state observed after the last action.
    fn observe(&mut self, state: &PageState);

    async fn next_action(&mut self) -> Result<AgentAction, PlannerError>;

    /// Tokens consumed since the planner was created.
    fn usage(&self) -> TokenUsage;
}

/// Hands out a new planner per pass, so no conversation is shared between
/// the scout and the main run or between work items.
pub trait PlannerFactory: Send + Sync {
    fn create(&self, role: PlannerRole) -> Box<dyn Planner>;
}

pub struct OpenAiPlannerFactory {
    client: Client,
    api_key: String,
    agent: config::Agent,
}

impl OpenAiPlannerFactory {
    pub fn new(api_key: String, agent: config::Agent) -> Self {
        Self {
            client: Client::new(),
            api_key,
            agent,
        }
    }
}

impl PlannerFactory for OpenAiPlannerFactory {
    fn create(&self, role: PlannerRole) -> Box<dyn Planner> {
        Box::new(OpenAiPlanner {
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            endpoint: format!("{}/chat/completions", self.agent.api_base.trim_end_matches('/')),
            model: self.agent.model.clone(),
            temperature: self.agent.temperature,
            role,
            conversation: Vec::new(),
            usage: TokenUsage::default(),
        })
    }
}

pub struct OpenAiPlanner {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
    temperature: f32,
    role: PlannerRole,
    conversation: Vec<ChatMessage>,
    usage: TokenUsage,
}

impl OpenAiPlanner {
    fn push(&mut self, role: &str, content: String) {
        self.conversation.push(ChatMessage {
            role: role.to_string(),
            content,
        });
    }

    /// One chat-completions round trip over the current conversation.
    async fn complete(&mut self) -> Result<String, PlannerError> {
        trim_conversation(&mut self.conversation, RECENT_MESSAGES);
        let messages: Vec<serde_json::Value> = self
            .conversation
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": self.temperature,
            }))
            .send()
            .await?;

        let status = response.status();
        let json_resp: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let message = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error")
                .to_string();
            warn!(role = ?self.role, status = status.as_u16(), %message, "planner API error");
            return Err(PlannerError::Api {
                status: status.as_u16(),
                message,
            });
        }

        self.usage += TokenUsage {
            input: json_resp["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output: json_resp["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        };

        let content = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| PlannerError::Parse(format!("no content in LLM response: {json_resp}")))?
            .to_string();

        debug!(role = ?self.role, reply = %content, "planner replied");
        self.push("assistant", content.clone());
        Ok(content)
    }
}

#[async_trait]
impl Planner for OpenAiPlanner {
    fn start_task(&mut self, task: &str) {
        self.conversation.clear();
        self.push("system", SYSTEM_PROMPT.to_string());
        self.push("user", format!("Task: {task}"));
    }

    fn observe(&mut self, state: &PageState) {
        self.push("user", render_observation(state));
    }

    async fn next_action(&mut self) -> Result<AgentAction, PlannerError> {
        let mut repairs = 0;
        loop {
            let content = self.complete().await?;
            match parse_reply(&content, self.role) {
                Err(PlannerError::Parse(reason)) if repairs < REPAIR_ATTEMPTS => {
                    repairs += 1;
                    warn!(role = ?self.role, %reason, "reply was not an action; asking again");
                    self.push(
                        "user",
                        format!("ERROR: {reason}\nReply with exactly one JSON action object."),
                    );
                }
                other => return other,
            }
        }
    }

    fn usage(&self) -> TokenUsage {
        self.usage
    }
}

/// Render an observation as the user message the planner sees.
pub fn render_observation(state: &PageState) -> String {
    let mut observation = format!(
        "Page URL: {}\nTitle: {}\n\nDOM:\n{}",
        state.url, state.title, state.dom_snapshot
    );

    if state.tabs.len() > 1 {
        observation.push_str("\n\nOpen tabs:");
        for tab in &state.tabs {
            let marker = if tab.active { " (active)" } else { "" };
            observation.push_str(&format!("\n- {} {}{}", tab.handle, tab.url, marker));
        }
    }

    for note in &state.notes {
        observation.push_str(&format!("\n\nSYSTEM: {note}"));
    }

    if let Some(ref err) = state.error {
        observation.push_str(&format!("\n\nERROR from last step: {err}"));
    }

    observation.push_str("\n\nWhat is your next action?");
    observation
}

/// Drop the oldest exchanges so at most `recent` messages follow the system
/// prompt and the task.
pub fn trim_conversation(conversation: &mut Vec<ChatMessage>, recent: usize) {
    const HEAD: usize = 2;
    if conversation.len() > HEAD + recent {
        let excess = conversation.len() - HEAD - recent;
        conversation.drain(HEAD..HEAD + excess);
    }
}

/// Parse the planner's reply into an action.
///
/// Markdown fences are stripped. For the scout, plain prose is read as a
/// completion declaration carrying that prose, which is how bare answers
/// such as "3" arrive. The main planner must always answer with JSON.
pub fn parse_reply(content: &str, role: PlannerRole) -> Result<AgentAction, PlannerError> {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if !cleaned.starts_with('{') {
        return match role {
            PlannerRole::Scout => Ok(AgentAction::DeclareDone {
                message: cleaned.to_string(),
            }),
            PlannerRole::Main => Err(PlannerError::Parse(format!("expected a JSON action, got: {cleaned}"))),
        };
    }

    serde_json::from_str(cleaned).map_err(|e| PlannerError::Parse(format!("{e}: {cleaned}")))
}
