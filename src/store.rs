//! Document store for harvest results.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Network(String),

    #[error("store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected store response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Network(err.to_string())
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Append `record` to `collection`, returning the generated key.
    async fn push(&self, collection: &str, record: &Value) -> Result<String, StoreError>;

    /// Every record of `collection` in key order.
    async fn get(&self, collection: &str) -> Result<Vec<Value>, StoreError>;
}

/// Firebase Realtime Database over its REST API.
pub struct FirebaseStore {
    client: Client,
    base_url: String,
}

impl FirebaseStore {
    pub fn new(project_id: &str) -> Self {
        Self::with_base_url(format!("https://{project_id}-default-rtdb.firebaseio.com"))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}.json", self.base_url, collection.trim_matches('/'))
    }
}

#[async_trait]
impl DocumentStore for FirebaseStore {
    async fn push(&self, collection: &str, record: &Value) -> Result<String, StoreError> {
        let url = self.collection_url(collection);
        let response = self.client.post(&url).json(record).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let reply: Value = response.json().await?;
        let key = reply["name"]
            .as_str()
            .ok_or_else(|| StoreError::Decode(reply.to_string()))?
            .to_string();
        debug!(collection = %collection, key = %key, "record pushed");
        Ok(key)
    }

    async fn get(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        let url = self.collection_url(collection);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let reply: Value = response.json().await?;
        records_from(reply)
    }
}

/// Firebase answers `null` for an empty collection and an object keyed by
/// push id otherwise.
fn records_from(reply: Value) -> Result<Vec<Value>, StoreError> {
    match reply {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => Ok(map.into_iter().map(|(_, v)| v).collect()),
        Value::Array(items) => Ok(items.into_iter().filter(|v| !v.is_null()).collect()),
        other => Err(StoreError::Decode(other.to_string())),
    }
}

/// In-process store for tests and embedders that want results without a
/// remote database.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<BTreeMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn push(&self, collection: &str, record: &Value) -> Result<String, StoreError> {
        let mut guard = self
            .collections
            .lock()
            .map_err(|_| StoreError::Network("memory store lock poisoned".into()))?;
        let items = guard.entry(collection.to_string()).or_default();
        items.push(record.clone());
        Ok(format!("{collection}-{}", items.len()))
    }

    async fn get(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        let guard = self
            .collections
            .lock()
            .map_err(|_| StoreError::Network("memory store lock poisoned".into()))?;
        Ok(guard.get(collection).cloned().unwrap_or_default())
    }
}
