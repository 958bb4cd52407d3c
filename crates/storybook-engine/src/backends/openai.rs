use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use storybook_contracts::models::BackendSpec;
use storybook_contracts::task::ImageSize;
use tracing::debug;

use super::{
    api_base_from_env, classify_http_failure, classify_transport_error, ensure_image_payload,
    non_empty_env, response_json_or_error, truncate_text, GenerateCall, GeneratedImage,
    ImageGenerator,
};
use crate::error::GenerationError;

const PROVIDER: &str = "OpenAI";

const DEFAULT_RESPONSES_MODEL: &str = "gpt-4.1";

const ILLUSTRATOR_INSTRUCTIONS: &str = "You are an expert children's book illustrator. \
Keep the people in the reference photos recognisable and draw one storybook image.";

/// OpenAI image generation. Plain prompts go to the Images API
/// (`/images/generations`); calls carrying reference photos go through the
/// Responses API with the `image_generation` tool so the photos can be
/// attached as `input_image` parts.
pub struct OpenAiGenerator {
    spec: BackendSpec,
    api_base: String,
    api_key: Option<String>,
    responses_model: String,
    http: HttpClient,
}

impl OpenAiGenerator {
    pub fn new(spec: BackendSpec, api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            spec,
            api_base: api_base.into(),
            api_key,
            responses_model: DEFAULT_RESPONSES_MODEL.to_string(),
            http: HttpClient::new(),
        }
    }

    /// `OPENAI_RESPONSES_MODEL` picks the model driving reference-guided calls.
    pub fn from_env(spec: BackendSpec) -> Self {
        let mut generator = Self::new(
            spec,
            api_base_from_env("OPENAI_API_BASE", "https://api.openai.com/v1"),
            non_empty_env("OPENAI_API_KEY"),
        );
        if let Some(model) = non_empty_env("OPENAI_RESPONSES_MODEL") {
            generator.responses_model = model;
        }
        generator
    }

    fn payload(&self, call: &GenerateCall) -> Value {
        json!({
            "model": self.spec.model,
            "prompt": call.prompt,
            "n": 1,
            "size": size_param(call.size),
            "quality": "high",
            "moderation": "low",
        })
    }

    fn responses_payload(&self, call: &GenerateCall) -> Value {
        let mut content = vec![json!({ "type": "input_text", "text": call.prompt })];
        content.extend(call.reference_images.iter().map(|reference| {
            json!({ "type": "input_image", "image_url": reference, "detail": "auto" })
        }));
        json!({
            "model": self.responses_model,
            "tools": [{
                "type": "image_generation",
                "size": size_param(call.size),
                "quality": "high",
                "moderation": "low",
            }],
            "tool_choice": { "type": "image_generation" },
            "input": [
                { "role": "system", "content": ILLUSTRATOR_INSTRUCTIONS },
                { "role": "user", "content": content },
            ],
        })
    }

    async fn post_json(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<Value, GenerationError> {
        let response = self
            .http
            .post(endpoint)
            .bearer_auth(api_key)
            .json(payload)
            .send()
            .await
            .map_err(|err| classify_transport_error(PROVIDER, &err))?;
        response_json_or_error(PROVIDER, response).await
    }

    async fn download_image(&self, url: &str) -> Result<GeneratedImage, GenerationError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| classify_transport_error(PROVIDER, &err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_failure(
                PROVIDER,
                status.as_u16(),
                None,
                &truncate_text(&body, 512),
            ));
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|err| classify_transport_error(PROVIDER, &err))?
            .to_vec();
        Ok(GeneratedImage { bytes, mime_type })
    }
}

pub(crate) fn size_param(size: ImageSize) -> &'static str {
    match size {
        ImageSize::Square => "1024x1024",
        ImageSize::Portrait => "1024x1536",
    }
}

enum ImageItem {
    Inline(Vec<u8>),
    Url(String),
}

fn first_image_item(response: &Value) -> Result<ImageItem, GenerationError> {
    let rows = response
        .get("data")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for row in rows {
        if let Some(b64) = row.get("b64_json").and_then(Value::as_str) {
            let bytes = BASE64.decode(b64.as_bytes()).map_err(|err| {
                GenerationError::TransientFailure(format!(
                    "{PROVIDER} image base64 decode failed: {err}"
                ))
            })?;
            return Ok(ImageItem::Inline(bytes));
        }
        if let Some(url) = row.get("url").and_then(Value::as_str) {
            return Ok(ImageItem::Url(url.to_string()));
        }
    }
    Err(GenerationError::TransientFailure(format!(
        "{PROVIDER} response returned no images"
    )))
}

/// The Responses API returns the picture as an `image_generation_call`
/// output item with base64 in `result`.
fn responses_image(response: &Value) -> Result<Vec<u8>, GenerationError> {
    let outputs = response
        .get("output")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let encoded = outputs
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("image_generation_call"))
        .find_map(|item| item.get("result").and_then(Value::as_str))
        .filter(|result| !result.is_empty());
    let Some(encoded) = encoded else {
        return Err(GenerationError::TransientFailure(format!(
            "{PROVIDER} response returned no images"
        )));
    };
    BASE64.decode(encoded.as_bytes()).map_err(|err| {
        GenerationError::TransientFailure(format!("{PROVIDER} image base64 decode failed: {err}"))
    })
}

#[async_trait]
impl ImageGenerator for OpenAiGenerator {
    fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    async fn generate(&self, call: &GenerateCall) -> Result<GeneratedImage, GenerationError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(GenerationError::InvalidRequest(
                "OPENAI_API_KEY not set".to_string(),
            ));
        };
        if !call.reference_images.is_empty() {
            let endpoint = format!("{}/responses", self.api_base);
            debug!(
                %endpoint,
                size = call.size.as_str(),
                references = call.reference_images.len(),
                "openai generate with references"
            );
            let payload = self
                .post_json(&endpoint, api_key, &self.responses_payload(call))
                .await?;
            let bytes = responses_image(&payload)?;
            ensure_image_payload(PROVIDER, &bytes)?;
            return Ok(GeneratedImage {
                bytes,
                mime_type: Some("image/png".to_string()),
            });
        }

        let endpoint = format!("{}/images/generations", self.api_base);
        debug!(%endpoint, size = call.size.as_str(), "openai generate");
        let payload = self
            .post_json(&endpoint, api_key, &self.payload(call))
            .await?;
        let image = match first_image_item(&payload)? {
            ImageItem::Inline(bytes) => GeneratedImage {
                bytes,
                mime_type: Some("image/png".to_string()),
            },
            ImageItem::Url(url) => self.download_image(&url).await?,
        };
        ensure_image_payload(PROVIDER, &image.bytes)?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use storybook_contracts::models::{BackendId, BackendRegistry};
    use storybook_contracts::request::Style;
    use storybook_contracts::task::ImageSize;

    use crate::backends::{GenerateCall, ImageGenerator};
    use crate::error::GenerationError;

    use super::{first_image_item, responses_image, ImageItem, OpenAiGenerator};

    fn generator(api_key: Option<String>) -> OpenAiGenerator {
        let spec = BackendRegistry::new(None)
            .get(BackendId::GptImage)
            .cloned()
            .unwrap_or_else(|| panic!("gpt-image should be registered"));
        OpenAiGenerator::new(spec, "http://127.0.0.1:9", api_key)
    }

    #[test]
    fn payload_uses_backend_model_and_portrait_size() {
        let call = GenerateCall::new("a lighthouse", ImageSize::Portrait, Style::Whimsical);
        let payload = generator(None).payload(&call);
        assert_eq!(payload["model"], json!("gpt-image-1"));
        assert_eq!(payload["size"], json!("1024x1536"));
        assert_eq!(payload["quality"], json!("high"));
        assert_eq!(payload["n"], json!(1));
    }

    #[test]
    fn response_items_prefer_inline_base64() {
        let inline = json!({"data": [{"b64_json": "iVBORw0KGgo="}]});
        assert!(matches!(
            first_image_item(&inline),
            Ok(ImageItem::Inline(bytes)) if bytes.starts_with(&[0x89, b'P', b'N', b'G'])
        ));
        let url = json!({"data": [{"url": "https://cdn.example/img.png"}]});
        assert!(matches!(first_image_item(&url), Ok(ImageItem::Url(_))));
        assert!(matches!(
            first_image_item(&json!({"data": []})),
            Err(GenerationError::TransientFailure(_))
        ));
    }

    #[test]
    fn reference_photos_become_input_image_parts() {
        let mut call = GenerateCall::new("Ada by the sea", ImageSize::Square, Style::Muted);
        call.reference_images = vec![
            "https://photos.test/ada.png".to_string(),
            "data:image/png;base64,iVBORw0KGgo=".to_string(),
        ];
        let payload = generator(None).responses_payload(&call);

        assert_eq!(payload["model"], json!("gpt-4.1"));
        assert_eq!(payload["tools"][0]["type"], json!("image_generation"));
        assert_eq!(payload["tools"][0]["size"], json!("1024x1024"));
        let content = &payload["input"][1]["content"];
        assert_eq!(content[0], json!({"type": "input_text", "text": "Ada by the sea"}));
        assert_eq!(content[1]["type"], json!("input_image"));
        assert_eq!(content[1]["image_url"], json!("https://photos.test/ada.png"));
        assert_eq!(
            content[2]["image_url"],
            json!("data:image/png;base64,iVBORw0KGgo=")
        );
    }

    #[test]
    fn responses_output_yields_generated_image() {
        let response = json!({"output": [
            {"type": "message", "content": []},
            {"type": "image_generation_call", "result": "iVBORw0KGgo="}
        ]});
        assert!(matches!(
            responses_image(&response),
            Ok(bytes) if bytes.starts_with(&[0x89, b'P', b'N', b'G'])
        ));
        assert!(matches!(
            responses_image(&json!({"output": [{"type": "message"}]})),
            Err(GenerationError::TransientFailure(_))
        ));
    }

    #[tokio::test]
    async fn missing_key_is_not_retryable() {
        let call = GenerateCall::new("a lighthouse", ImageSize::Square, Style::Muted);
        let err = generator(None).generate(&call).await.err();
        assert!(matches!(err, Some(GenerationError::InvalidRequest(_))));
    }
}
