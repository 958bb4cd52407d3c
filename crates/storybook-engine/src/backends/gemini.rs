use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use storybook_contracts::models::BackendSpec;
use storybook_contracts::task::ImageSize;
use tracing::debug;

use super::{
    api_base_from_env, classify_transport_error, ensure_image_payload, load_reference_images,
    non_empty_env, response_json_or_error, GenerateCall, GeneratedImage, ImageGenerator,
    ReferenceImage,
};
use crate::error::GenerationError;

const PROVIDER: &str = "Gemini";

const SAFETY_FINISH_REASONS: [&str; 5] = [
    "SAFETY",
    "IMAGE_SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
];

/// Gemini `generateContent` with the IMAGE response modality.
pub struct GeminiGenerator {
    spec: BackendSpec,
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl GeminiGenerator {
    pub fn new(spec: BackendSpec, api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            spec,
            api_base: api_base.into(),
            api_key,
            http: HttpClient::new(),
        }
    }

    /// `GEMINI_MODEL_ID` overrides the registry model.
    pub fn from_env(mut spec: BackendSpec) -> Self {
        if let Some(model) = non_empty_env("GEMINI_MODEL_ID") {
            spec.model = model;
        }
        Self::new(
            spec,
            api_base_from_env(
                "GEMINI_API_BASE",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY")),
        )
    }

    fn endpoint(&self) -> String {
        let trimmed = self.spec.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    /// Prompt text first, then one `inlineData` part per reference photo.
    fn payload(&self, call: &GenerateCall, references: &[ReferenceImage]) -> Value {
        let mut parts = vec![json!({ "text": call.prompt })];
        parts.extend(references.iter().map(|reference| {
            json!({
                "inlineData": {
                    "mimeType": reference.mime_type,
                    "data": BASE64.encode(&reference.bytes),
                }
            })
        }));
        json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
            "generationConfig": {
                "candidateCount": 1,
                "responseModalities": ["IMAGE"],
                "imageConfig": { "aspectRatio": aspect_ratio(call.size) },
            },
        })
    }
}

pub(crate) fn aspect_ratio(size: ImageSize) -> &'static str {
    match size {
        ImageSize::Square => "1:1",
        ImageSize::Portrait => "3:4",
    }
}

/// Pulls the first inline image out of a response, classifying safety
/// blocks as `ContentRejected`.
fn extract_image(response: &Value) -> Result<GeneratedImage, GenerationError> {
    if let Some(reason) = response
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return Err(GenerationError::ContentRejected(format!(
            "{PROVIDER} blocked the prompt ({reason})"
        )));
    }

    let candidates = response
        .get("candidates")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let mut safety_reason = None;
    for candidate in candidates {
        let parts = candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for part in parts {
            let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) else {
                continue;
            };
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64.decode(data.as_bytes()).map_err(|err| {
                GenerationError::TransientFailure(format!(
                    "{PROVIDER} image base64 decode failed: {err}"
                ))
            })?;
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(GeneratedImage { bytes, mime_type });
        }
        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            if SAFETY_FINISH_REASONS.contains(&reason) {
                safety_reason = Some(reason.to_string());
            }
        }
    }

    match safety_reason {
        Some(reason) => Err(GenerationError::ContentRejected(format!(
            "{PROVIDER} withheld the image ({reason})"
        ))),
        None => Err(GenerationError::TransientFailure(format!(
            "{PROVIDER} returned no images"
        ))),
    }
}

#[async_trait]
impl ImageGenerator for GeminiGenerator {
    fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    async fn generate(&self, call: &GenerateCall) -> Result<GeneratedImage, GenerationError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(GenerationError::InvalidRequest(
                "GEMINI_API_KEY or GOOGLE_API_KEY not set".to_string(),
            ));
        };
        let references =
            load_reference_images(&self.http, PROVIDER, &call.reference_images).await;
        let endpoint = self.endpoint();
        debug!(
            %endpoint,
            aspect = aspect_ratio(call.size),
            references = references.len(),
            "gemini generate"
        );

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .json(&self.payload(call, &references))
            .send()
            .await
            .map_err(|err| classify_transport_error(PROVIDER, &err))?;
        let payload = response_json_or_error(PROVIDER, response).await?;
        let image = extract_image(&payload)?;
        ensure_image_payload(PROVIDER, &image.bytes)?;
        Ok(image)
    }
}
