use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "om-harvester.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub agent: Agent,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub browser: Browser,
    #[serde(default)]
    pub contact: Contact,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub pricing: Pricing,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&raw).map_err(|e| match e {
            ConfigError::Invalid(reason) => ConfigError::Unreadable {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Load `user` if given, else `./om-harvester.toml` when present, else defaults.
    pub fn resolve(user: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(p) = user {
            return Self::load(p);
        }
        let default = PathBuf::from(DEFAULT_CONFIG_FILE);
        if default.exists() {
            Self::load(&default)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timing.inter_item_delay_secs == 0 {
            return Err(ConfigError::Invalid(
                "timing.inter_item_delay_secs must be greater than zero".into(),
            ));
        }
        if self.agent.scout_step_cap == 0
            || self.agent.single_step_cap == 0
            || self.agent.batch_step_cap == 0
        {
            return Err(ConfigError::Invalid("agent step caps must be non-zero".into()));
        }
        if self.agent.batch_step_cap < self.agent.single_step_cap {
            return Err(ConfigError::Invalid(
                "agent.batch_step_cap must not be below agent.single_step_cap".into(),
            ));
        }
        Ok(())
    }

    pub fn history_path(&self) -> PathBuf {
        self.paths
            .history_file
            .clone()
            .unwrap_or_else(|| self.paths.downloads_dir.join("download_history.json"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    /// Root under which every domain gets its own bucket directory.
    pub downloads_dir: PathBuf,
    pub history_file: Option<PathBuf>,
    pub report_file: Option<PathBuf>,
}
impl Default for Paths {
    fn default() -> Self {
        let base = dirs::download_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            downloads_dir: base.join("om-harvester"),
            history_file: None,
            report_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub model: String,
    pub temperature: f32,
    pub api_base: String,
    pub scout_step_cap: usize,
    pub single_step_cap: usize,
    pub batch_step_cap: usize,
}
impl Default for Agent {
    fn default() -> Self {
        Self {
            model: "gpt-4o".into(),
            temperature: 0.1,
            api_base: "https://api.openai.com/v1".into(),
            scout_step_cap: 6,
            single_step_cap: 12,
            batch_step_cap: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timing {
    /// Pause between work items. Never zero.
    pub inter_item_delay_secs: u64,
    /// Wait after an action that may start a download, before inspecting the sink.
    pub post_action_wait_ms: u64,
    /// Final wait before the last directory check and browser teardown.
    pub settle_wait_secs: u64,
    /// HTTP timeout for direct document fetches.
    pub fetch_timeout_secs: u64,
}
impl Default for Timing {
    fn default() -> Self {
        Self {
            inter_item_delay_secs: 10,
            post_action_wait_ms: 2500,
            settle_wait_secs: 5,
            fetch_timeout_secs: 30,
        }
    }
}
impl Timing {
    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_secs(self.inter_item_delay_secs)
    }
    pub fn post_action_wait(&self) -> Duration {
        Duration::from_millis(self.post_action_wait_ms)
    }
    pub fn settle_wait(&self) -> Duration {
        Duration::from_secs(self.settle_wait_secs)
    }
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Browser {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub window_width: u32,
    pub window_height: u32,
    pub idle_timeout_secs: u64,
    pub extra_args: Vec<String>,
}
impl Default for Browser {
    fn default() -> Self {
        Self {
            headless: false,
            chrome_path: None,
            window_width: 1280,
            window_height: 1024,
            idle_timeout_secs: 180,
            extra_args: vec![
                "--no-first-run".into(),
                "--no-default-browser-check".into(),
                "--disable-blink-features=AutomationControlled".into(),
                "--disable-infobars".into(),
                "--disable-popup-blocking".into(),
                "--password-store=basic".into(),
            ],
        }
    }
}

/// Identity used when a site gates its documents behind a contact form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub company: String,
    pub contact_type: String,
    pub state: String,
}
impl Default for Contact {
    fn default() -> Self {
        Self {
            name: "John Doe".into(),
            email: "johndoe@email.com".into(),
            phone: "555-123-4567".into(),
            company: "Real Estate Investments LLC".into(),
            contact_type: "Broker".into(),
            state: "California".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub file: Option<PathBuf>,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    /// Overridden by `FIREBASE_PROJECT_ID` when set.
    pub firebase_project_id: Option<String>,
    pub collection: String,
}
impl Default for Store {
    fn default() -> Self {
        Self {
            firebase_project_id: None,
            collection: "om_downloads".into(),
        }
    }
}

/// USD per one million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pricing {
    pub models: BTreeMap<String, ModelPrice>,
}
impl Default for Pricing {
    fn default() -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            "gpt-4o".to_string(),
            ModelPrice {
                input: 2.50,
                output: 10.00,
            },
        );
        models.insert(
            "gpt-4o-mini".to_string(),
            ModelPrice {
                input: 0.15,
                output: 0.60,
            },
        );
        Self { models }
    }
}
impl Pricing {
    /// Unknown models are priced like gpt-4o.
    pub fn price_for(&self, model: &str) -> ModelPrice {
        self.models
            .get(model)
            .or_else(|| self.models.get("gpt-4o"))
            .copied()
            .unwrap_or(ModelPrice {
                input: 2.50,
                output: 10.00,
            })
    }
}

/// Secrets supplied out-of-band through the environment (or `.env`).
#[derive(Debug, Clone)]
pub struct Credentials {
    pub openai_api_key: String,
    pub firebase_project_id: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingCredential("OPENAI_API_KEY"))?;
        let firebase_project_id = std::env::var("FIREBASE_PROJECT_ID")
            .ok()
            .filter(|p| !p.trim().is_empty());
        Ok(Self {
            openai_api_key,
            firebase_project_id,
        })
    }
}

/// Create `dir` if needed and prove it is writable with a probe file.
pub fn ensure_writable_dir(dir: &Path) -> Result<(), ConfigError> {
    let unwritable = |e: std::io::Error| ConfigError::Unwritable {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    };
    std::fs::create_dir_all(dir).map_err(unwritable)?;
    let probe = dir.join(".om-harvester-write-probe");
    std::fs::write(&probe, b"ok").map_err(unwritable)?;
    std::fs::remove_file(&probe).map_err(unwritable)?;
    Ok(())
}
