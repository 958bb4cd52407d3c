use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::task::ImageSize;

/// Closed set of image-generation backends the engine knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendId {
    GptImage,
    NanoBanana,
    Dryrun,
}

impl BackendId {
    pub const ALL: [BackendId; 3] = [BackendId::GptImage, BackendId::NanoBanana, BackendId::Dryrun];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GptImage => "gpt-image",
            Self::NanoBanana => "nano-banana",
            Self::Dryrun => "dryrun",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|id| id.as_str() == normalized)
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub id: BackendId,
    pub provider: String,
    pub model: String,
    pub aliases: Vec<String>,
    pub max_prompt_chars: usize,
    pub sizes: Vec<ImageSize>,
    pub stanza_size: ImageSize,
    pub cover_size: ImageSize,
}

impl BackendSpec {
    pub fn supports_size(&self, size: ImageSize) -> bool {
        self.sizes.contains(&size)
    }

    fn answers_to(&self, name: &str) -> bool {
        self.id.as_str() == name || self.aliases.iter().any(|alias| alias == name)
    }
}

#[derive(Debug, Clone)]
pub struct BackendRegistry {
    backends: IndexMap<BackendId, BackendSpec>,
}

impl BackendRegistry {
    pub fn new(backends: Option<IndexMap<BackendId, BackendSpec>>) -> Self {
        Self {
            backends: backends.unwrap_or_else(default_backends),
        }
    }

    pub fn get(&self, id: BackendId) -> Option<&BackendSpec> {
        self.backends.get(&id)
    }

    pub fn list(&self) -> impl Iterator<Item = &BackendSpec> {
        self.backends.values()
    }

    /// Resolves a backend id or one of its aliases, case-insensitively.
    pub fn resolve(&self, name: &str) -> Option<&BackendSpec> {
        let normalized = name.trim().to_ascii_lowercase();
        self.backends
            .values()
            .find(|spec| spec.answers_to(&normalized))
    }

    pub fn names(&self) -> Vec<String> {
        self.backends
            .keys()
            .map(|id| id.as_str().to_string())
            .collect()
    }
}

fn default_backends() -> IndexMap<BackendId, BackendSpec> {
    let mut map = IndexMap::new();

    let mut insert = |id: BackendId,
                      provider: &str,
                      model: &str,
                      aliases: &[&str],
                      max_prompt_chars: usize| {
        map.insert(
            id,
            BackendSpec {
                id,
                provider: provider.to_string(),
                model: model.to_string(),
                aliases: aliases.iter().map(|item| (*item).to_string()).collect(),
                max_prompt_chars,
                sizes: vec![ImageSize::Square, ImageSize::Portrait],
                stanza_size: ImageSize::Square,
                cover_size: ImageSize::Portrait,
            },
        );
    };

    insert(
        BackendId::GptImage,
        "openai",
        "gpt-image-1",
        &["openai", "gpt-image-1"],
        32000,
    );
    insert(
        BackendId::NanoBanana,
        "gemini",
        "gemini-3-pro-image-preview",
        &["gemini", "gemini-3-pro-image-preview"],
        16000,
    );
    insert(
        BackendId::Dryrun,
        "dryrun",
        "dryrun-image-1",
        &["dryrun-image-1"],
        32000,
    );

    map
}
