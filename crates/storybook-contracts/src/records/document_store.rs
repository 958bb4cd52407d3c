use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// A JSON object file used as a keyed document collection.
///
/// Every read refreshes from disk and every write merges only the keys this
/// instance changed into the current on-disk payload, so two processes
/// sharing a file don't drop each other's documents.
#[derive(Debug, Clone)]
pub struct JsonDocumentStore {
    path: PathBuf,
    payload: Option<Map<String, Value>>,
    dirty_keys: Vec<String>,
}

impl JsonDocumentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: None,
            dirty_keys: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&mut self, key: &str) -> Option<Value> {
        self.ensure_loaded().get(key).cloned()
    }

    pub fn get_as<T: DeserializeOwned>(&mut self, key: &str) -> anyhow::Result<Option<T>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value)?))
    }

    pub fn set(&mut self, key: &str, value: Value) -> anyhow::Result<()> {
        let payload = self.ensure_loaded();
        if payload.get(key) == Some(&value) {
            return Ok(());
        }
        payload.insert(key.to_string(), value);
        if !self.dirty_keys.iter().any(|existing| existing == key) {
            self.dirty_keys.push(key.to_string());
        }
        self.flush()
    }

    pub fn put<T: Serialize>(&mut self, key: &str, document: &T) -> anyhow::Result<()> {
        self.set(key, serde_json::to_value(document)?)
    }

    pub fn values(&mut self) -> Vec<Value> {
        self.ensure_loaded().values().cloned().collect()
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.payload.is_none() || self.dirty_keys.is_empty() {
            return Ok(());
        }

        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if let Some(payload) = &self.payload {
            for key in &self.dirty_keys {
                if let Some(value) = payload.get(key) {
                    on_disk.insert(key.clone(), value.clone());
                }
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = Some(on_disk);
        self.dirty_keys.clear();
        Ok(())
    }

    fn ensure_loaded(&mut self) -> &mut Map<String, Value> {
        self.payload
            .insert(read_json_object(&self.path).unwrap_or_default())
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}
