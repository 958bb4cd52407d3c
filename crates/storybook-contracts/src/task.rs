use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::models::BackendId;
use crate::request::Style;

/// Identity of a task within one job. Stanzas order before the cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum TaskKind {
    Stanza(usize),
    Cover,
}

impl TaskKind {
    pub fn is_cover(&self) -> bool {
        matches!(self, Self::Cover)
    }

    /// Stable human-readable label, 1-based for stanzas.
    pub fn label(&self) -> String {
        match self {
            Self::Stanza(index) => format!("stanza-{:02}", index + 1),
            Self::Cover => "cover".to_string(),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSize {
    Square,
    Portrait,
}

impl ImageSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Square => "square",
            Self::Portrait => "portrait",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collapses every whitespace run to a single space and trims the ends, so
/// formatting-only differences in a prompt share a cache identity.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt.split_whitespace().collect::<Vec<&str>>().join(" ")
}

pub fn fingerprint(prompt: &str, style: Style, backend: BackendId, kind: TaskKind) -> Fingerprint {
    fingerprint_with_references(prompt, style, backend, kind, &[])
}

/// Reference images are part of the identity: the same prompt drawn against
/// different photos is a different picture. Reference order is ignored.
pub fn fingerprint_with_references(
    prompt: &str,
    style: Style,
    backend: BackendId,
    kind: TaskKind,
    references: &[String],
) -> Fingerprint {
    let mut payload = json!({
        "prompt": normalize_prompt(prompt),
        "style": style.as_str(),
        "backend": backend.as_str(),
        "kind": kind.label(),
    });
    if !references.is_empty() {
        let mut sorted: Vec<&str> = references.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        payload["references"] = json!(sorted);
    }
    Fingerprint(stable_hash(&payload))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationTask {
    pub fingerprint: Fingerprint,
    pub prompt: String,
    pub size: ImageSize,
    pub style: Style,
    pub backend: BackendId,
    pub kind: TaskKind,
    /// URLs or `data:` URIs handed to the backend alongside the prompt.
    pub reference_images: Vec<String>,
}

impl GenerationTask {
    pub fn new(
        prompt: impl Into<String>,
        size: ImageSize,
        style: Style,
        backend: BackendId,
        kind: TaskKind,
    ) -> Self {
        let prompt = prompt.into();
        Self {
            fingerprint: fingerprint(&prompt, style, backend, kind),
            prompt,
            size,
            style,
            backend,
            kind,
            reference_images: Vec::new(),
        }
    }

    pub fn with_reference_images(mut self, references: Vec<String>) -> Self {
        self.fingerprint = fingerprint_with_references(
            &self.prompt,
            self.style,
            self.backend,
            self.kind,
            &references,
        );
        self.reference_images = references;
        self
    }
}

pub fn stable_hash(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
