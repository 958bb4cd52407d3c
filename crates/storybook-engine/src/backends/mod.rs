mod dryrun;
mod gemini;
mod openai;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::Value;
use storybook_contracts::models::{BackendId, BackendRegistry, BackendSpec};
use storybook_contracts::request::Style;
use storybook_contracts::task::ImageSize;

use tracing::{debug, warn};

use crate::error::GenerationError;

pub use dryrun::DryrunGenerator;
pub use gemini::GeminiGenerator;
pub use openai::OpenAiGenerator;

/// Canonical single-image request handed to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateCall {
    pub prompt: String,
    pub size: ImageSize,
    pub style: Style,
    /// Subject photos as URLs or `data:` URIs.
    pub reference_images: Vec<String>,
}

impl GenerateCall {
    pub fn new(prompt: impl Into<String>, size: ImageSize, style: Style) -> Self {
        Self {
            prompt: prompt.into(),
            size,
            style,
            reference_images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// One image-generation backend. Implementations hold no per-call mutable
/// state and are shared across concurrent tasks.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    fn spec(&self) -> &BackendSpec;

    /// Local checks that must pass before any network call.
    fn validate(&self, call: &GenerateCall) -> Result<(), GenerationError> {
        validate_call(self.spec(), call)
    }

    async fn generate(&self, call: &GenerateCall) -> Result<GeneratedImage, GenerationError>;
}

pub fn validate_call(spec: &BackendSpec, call: &GenerateCall) -> Result<(), GenerationError> {
    if call.prompt.trim().is_empty() {
        return Err(GenerationError::InvalidRequest(format!(
            "{}: prompt is empty",
            spec.id
        )));
    }
    let chars = call.prompt.chars().count();
    if chars > spec.max_prompt_chars {
        return Err(GenerationError::InvalidRequest(format!(
            "{}: prompt is {chars} chars (max {})",
            spec.id, spec.max_prompt_chars
        )));
    }
    if !spec.supports_size(call.size) {
        return Err(GenerationError::InvalidRequest(format!(
            "{}: unsupported size '{}'",
            spec.id,
            call.size.as_str()
        )));
    }
    Ok(())
}

#[derive(Default, Clone)]
pub struct GeneratorRegistry {
    generators: BTreeMap<BackendId, Arc<dyn ImageGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<G: ImageGenerator + 'static>(&mut self, generator: G) {
        self.register_shared(Arc::new(generator));
    }

    pub fn register_shared(&mut self, generator: Arc<dyn ImageGenerator>) {
        self.generators.insert(generator.spec().id, generator);
    }

    pub fn get(&self, id: BackendId) -> Option<Arc<dyn ImageGenerator>> {
        self.generators.get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<BackendId> {
        self.generators.keys().copied().collect()
    }
}

/// Registers every backend in `backends` with credentials from the
/// environment. Missing keys surface per call as `InvalidRequest`.
pub fn default_registry(backends: &BackendRegistry) -> GeneratorRegistry {
    let mut registry = GeneratorRegistry::new();
    for spec in backends.list() {
        match spec.id {
            BackendId::GptImage => registry.register(OpenAiGenerator::from_env(spec.clone())),
            BackendId::NanoBanana => registry.register(GeminiGenerator::from_env(spec.clone())),
            BackendId::Dryrun => registry.register(DryrunGenerator::new(spec.clone())),
        }
    }
    registry
}

const REJECTION_MARKERS: [&str; 7] = [
    "safety",
    "moderation",
    "content policy",
    "content_policy",
    "policy_violation",
    "prohibited",
    "blocked",
];

/// Maps a non-success HTTP response onto the generation taxonomy.
pub fn classify_http_failure(
    provider: &str,
    status: u16,
    retry_after: Option<&str>,
    body: &str,
) -> GenerationError {
    let message = format!("{provider} request failed ({status}): {}", truncate_text(body, 512));
    match status {
        429 => GenerationError::rate_limited(message, retry_after.and_then(parse_retry_after)),
        408 | 500..=599 => GenerationError::TransientFailure(message),
        _ => {
            let lowered = body.to_ascii_lowercase();
            if REJECTION_MARKERS
                .iter()
                .any(|marker| lowered.contains(marker))
            {
                GenerationError::ContentRejected(message)
            } else {
                GenerationError::InvalidRequest(message)
            }
        }
    }
}

pub fn classify_transport_error(provider: &str, err: &reqwest::Error) -> GenerationError {
    let message = format!("{provider} transport error: {}", error_chain_text(err, 512));
    if err.is_builder() {
        return GenerationError::InvalidRequest(message);
    }
    GenerationError::TransientFailure(message)
}

/// Accepts delta-seconds or an HTTP-date.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(trimmed).ok()?;
    let delta = at.with_timezone(&Utc) - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

pub(crate) async fn response_json_or_error(
    provider: &str,
    response: reqwest::Response,
) -> Result<Value, GenerationError> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response
        .text()
        .await
        .map_err(|err| classify_transport_error(provider, &err))?;
    if !status.is_success() {
        return Err(classify_http_failure(
            provider,
            status.as_u16(),
            retry_after.as_deref(),
            &body,
        ));
    }
    serde_json::from_str(&body).map_err(|err| {
        GenerationError::TransientFailure(format!(
            "{provider} returned invalid JSON payload: {err}"
        ))
    })
}

/// Reference image bytes ready to inline into a provider payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReferenceImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Resolves a `data:` URI locally or downloads an http(s) URL. References
/// that can't be loaded are skipped so one bad photo doesn't sink the task.
pub(crate) async fn load_reference_images(
    http: &reqwest::Client,
    provider: &str,
    references: &[String],
) -> Vec<ReferenceImage> {
    let mut loaded = Vec::with_capacity(references.len());
    for reference in references {
        let result = match decode_data_uri(reference) {
            Some(decoded) => decoded,
            None => fetch_reference(http, reference).await,
        };
        match result {
            Ok(image) => loaded.push(image),
            Err(reason) => warn!(
                provider,
                reference = %truncate_text(reference, 100),
                %reason,
                "skipping reference image"
            ),
        }
    }
    debug!(provider, requested = references.len(), loaded = loaded.len(), "reference images");
    loaded
}

/// `None` when `reference` is not a `data:` URI at all.
pub(crate) fn decode_data_uri(reference: &str) -> Option<Result<ReferenceImage, String>> {
    let rest = reference.strip_prefix("data:")?;
    let Some((header, encoded)) = rest.split_once(',') else {
        return Some(Err("data URI has no payload".to_string()));
    };
    let Some(media) = header.strip_suffix(";base64") else {
        return Some(Err("data URI is not base64 encoded".to_string()));
    };
    Some(
        BASE64
            .decode(encoded.trim().as_bytes())
            .map_err(|err| format!("data URI base64 decode failed: {err}"))
            .and_then(|bytes| sniff_reference(bytes, Some(media))),
    )
}

async fn fetch_reference(http: &reqwest::Client, url: &str) -> Result<ReferenceImage, String> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err("unsupported reference scheme".to_string());
    }
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|err| error_chain_text(&err, 256))?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("fetch returned {status}"));
    }
    let header_mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .bytes()
        .await
        .map_err(|err| error_chain_text(&err, 256))?;
    sniff_reference(bytes.to_vec(), header_mime.as_deref())
}

fn sniff_reference(bytes: Vec<u8>, declared: Option<&str>) -> Result<ReferenceImage, String> {
    let format = image::guess_format(&bytes).map_err(|_| "not a recognised image".to_string())?;
    let mime_type = declared
        .map(str::trim)
        .filter(|mime| mime.starts_with("image/"))
        .map(str::to_string)
        .unwrap_or_else(|| format.to_mime_type().to_string());
    Ok(ReferenceImage { mime_type, bytes })
}

/// Rejects payloads that don't sniff as an image.
pub fn ensure_image_payload(provider: &str, bytes: &[u8]) -> Result<(), GenerationError> {
    if bytes.is_empty() {
        return Err(GenerationError::TransientFailure(format!(
            "{provider} returned an empty image"
        )));
    }
    image::guess_format(bytes).map(|_| ()).map_err(|_| {
        GenerationError::TransientFailure(format!(
            "{provider} returned bytes that are not a recognised image"
        ))
    })
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn api_base_from_env(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}

fn error_chain_text(err: &(dyn std::error::Error + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = cause {
        let text = current.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(String::as_str) != Some(trimmed) {
            parts.push(trimmed.to_string());
        }
        cause = current.source();
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
