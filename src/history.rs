//! Artifacts harvested by earlier invocations, persisted as JSON.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub url: String,
    pub files: Vec<PathBuf>,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub artifacts: Vec<HistoryEntry>,
}

impl History {
    /// Load the history file. A missing or unreadable file is an empty history.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no download history yet");
                return Self::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(history) => history,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "download history is corrupt; starting empty");
                Self::default()
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.artifacts.iter().any(|a| a.id == id)
    }

    /// Record a harvested target. Re-recording an id replaces its entry.
    pub fn record(&mut self, url: &str, files: Vec<PathBuf>) {
        let id = artifact_id(url);
        self.artifacts.retain(|a| a.id != id);
        self.artifacts.push(HistoryEntry {
            id,
            url: url.to_string(),
            files,
            recorded_at: now_rfc3339(),
        });
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing history {}", path.display()))?;
        Ok(())
    }
}

/// Identifier of a target: host without `www.`, path without trailing
/// slashes, and the query when present. Host and path are lower-cased.
/// Anything that does not parse as a URL is used lower-cased as is.
pub fn artifact_id(target: &str) -> String {
    let target = target.trim().trim_start_matches('@');
    let Ok(parsed) = url::Url::parse(target) else {
        return target.to_lowercase();
    };
    let host = parsed.host_str().unwrap_or_default();
    let host = host.strip_prefix("www.").unwrap_or(host);
    let mut id = format!("{host}{}", parsed.path().trim_end_matches('/')).to_lowercase();
    if let Some(query) = parsed.query().filter(|q| !q.is_empty()) {
        id.push('?');
        id.push_str(query);
    }
    id
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}
