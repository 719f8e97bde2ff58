use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backend::KvBackend;

/// Namespaced JSON values with last-write-wins semantics and no expiry.
#[derive(Clone)]
pub struct KeyValueStore {
    backend: Arc<dyn KvBackend>,
    prefix: String,
}

impl KeyValueStore {
    pub fn new(backend: Arc<dyn KvBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let full_key = self.key(key);
        let Some(raw) = self
            .backend
            .get(&full_key)
            .await
            .with_context(|| format!("failed to read {full_key}"))?
        else {
            return Ok(None);
        };
        let value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to decode value stored at {full_key}"))?;
        Ok(Some(value))
    }

    pub async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let full_key = self.key(key);
        let raw = serde_json::to_string(value)?;
        self.backend
            .set(&full_key, &raw)
            .await
            .with_context(|| format!("failed to write {full_key}"))
    }
}
