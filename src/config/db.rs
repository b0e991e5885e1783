//! Configuration-database lookup. Phase-1 configure reads the trigger
//! document to learn which decide library to load.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigDbError {
    #[error("document '{0}' not found in the configuration database")]
    NotFound(String),
    #[error("configuration fetch failed: {0}")]
    Fetch(String),
    #[error("document '{document}' is missing key '{key}'")]
    MissingKey { document: String, key: String },
}

/// Source of configuration documents, keyed by document name.
pub trait ConfigDb: Send {
    fn fetch(&self, document: &str) -> Result<Value, ConfigDbError>;
}

/// Fetches documents from the configuration web service.
pub struct HttpConfigDb {
    client: reqwest::blocking::Client,
    base: String,
}

impl HttpConfigDb {
    pub fn new(base: impl Into<String>) -> Result<Self, ConfigDbError> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|err| ConfigDbError::Fetch(format!("http client build failed: {err}")))?;
        Ok(Self {
            client,
            base: base.into(),
        })
    }
}

impl ConfigDb for HttpConfigDb {
    fn fetch(&self, document: &str) -> Result<Value, ConfigDbError> {
        let url = format!("{}/{document}", self.base.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| ConfigDbError::Fetch(format!("config rpc failed: {err}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ConfigDbError::NotFound(document.to_string()));
        }
        if !response.status().is_success() {
            return Err(ConfigDbError::Fetch(format!(
                "config rpc returned status {}",
                response.status()
            )));
        }
        response
            .json()
            .map_err(|err| ConfigDbError::Fetch(format!("config decode failed: {err}")))
    }
}

/// In-memory document store for tests and standalone runs.
#[derive(Default)]
pub struct MemConfigDb {
    documents: Mutex<HashMap<String, Value>>,
}

impl MemConfigDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: &str, value: Value) {
        self.documents
            .lock()
            .unwrap()
            .insert(document.to_string(), value);
    }
}

impl ConfigDb for MemConfigDb {
    fn fetch(&self, document: &str) -> Result<Value, ConfigDbError> {
        self.documents
            .lock()
            .unwrap()
            .get(document)
            .cloned()
            .ok_or_else(|| ConfigDbError::NotFound(document.to_string()))
    }
}

/// Extracts a required string key from a fetched document.
pub fn string_key(document: &str, value: &Value, key: &str) -> Result<String, ConfigDbError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ConfigDbError::MissingKey {
            document: document.to_string(),
            key: key.to_string(),
        })
}
