use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Style {
    #[default]
    TexturedWatercolor,
    BoldAndBright,
    Abstract,
    Whimsical,
    Muted,
}

impl Style {
    pub const ALL: [Style; 5] = [
        Style::TexturedWatercolor,
        Style::BoldAndBright,
        Style::Abstract,
        Style::Whimsical,
        Style::Muted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TexturedWatercolor => "textured-watercolor",
            Self::BoldAndBright => "bold-and-bright",
            Self::Abstract => "abstract",
            Self::Whimsical => "whimsical",
            Self::Muted => "muted",
        }
    }

    /// Accepts the canonical kebab-case name as well as spaced or
    /// underscored spellings, case-insensitively.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw
            .trim()
            .to_ascii_lowercase()
            .replace(['_', ' '], "-");
        Self::ALL
            .into_iter()
            .find(|style| style.as_str() == normalized)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::TexturedWatercolor => {
                "soft textured watercolor with visible paper grain and gentle washes of colour"
            }
            Self::BoldAndBright => "bold saturated colours with clean shapes and crisp outlines",
            Self::Abstract => "abstract forms and expressive shapes that suggest rather than depict",
            Self::Whimsical => "playful, whimsical storybook art with exaggerated friendly shapes",
            Self::Muted => "calm muted palette with low contrast and quiet, cosy lighting",
        }
    }
}

/// One person who may appear in the illustrations. Photo references are
/// carried through untouched; the core never dereferences them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Subject {
    pub name: String,
    #[serde(default)]
    pub relationship: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub photo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SubjectMetadata {
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub poem_text: String,
    #[serde(default)]
    pub subjects: SubjectMetadata,
    #[serde(default)]
    pub style: Style,
    #[serde(default)]
    pub model: Option<String>,
}

impl GenerationRequest {
    pub fn new(poem_text: impl Into<String>, style: Style) -> Self {
        Self {
            poem_text: poem_text.into(),
            subjects: SubjectMetadata::default(),
            style,
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_subject(mut self, subject: Subject) -> Self {
        self.subjects.subjects.push(subject);
        self
    }

    pub fn stanzas(&self) -> Vec<Stanza> {
        split_stanzas(&self.poem_text)
    }

    /// Subject photos in subject order, blanks and repeats dropped.
    pub fn reference_images(&self) -> Vec<String> {
        let mut references: Vec<String> = Vec::new();
        for photo in self
            .subjects
            .subjects
            .iter()
            .filter_map(|subject| subject.photo.as_deref())
            .map(str::trim)
            .filter(|photo| !photo.is_empty())
        {
            if !references.iter().any(|seen| seen == photo) {
                references.push(photo.to_string());
            }
        }
        references
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    pub index: usize,
    pub text: String,
}

/// Splits poem text into stanzas separated by one or more blank lines.
pub fn split_stanzas(poem_text: &str) -> Vec<Stanza> {
    let mut stanzas = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in poem_text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            push_stanza(&mut stanzas, &mut current);
            continue;
        }
        current.push(line);
    }
    push_stanza(&mut stanzas, &mut current);
    stanzas
}

fn push_stanza(stanzas: &mut Vec<Stanza>, current: &mut Vec<&str>) {
    if current.is_empty() {
        return;
    }
    stanzas.push(Stanza {
        index: stanzas.len(),
        text: current.join("\n"),
    });
    current.clear();
}
