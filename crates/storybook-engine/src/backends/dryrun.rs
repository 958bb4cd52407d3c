use std::io::Cursor;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};
use storybook_contracts::models::BackendSpec;
use storybook_contracts::task::ImageSize;

use super::{GenerateCall, GeneratedImage, ImageGenerator};
use crate::error::GenerationError;

/// Offline backend: a solid-colour PNG whose colour is derived from the
/// prompt, so identical calls yield identical bytes.
pub struct DryrunGenerator {
    spec: BackendSpec,
}

impl DryrunGenerator {
    pub fn new(spec: BackendSpec) -> Self {
        Self { spec }
    }
}

fn dims(size: ImageSize) -> (u32, u32) {
    match size {
        ImageSize::Square => (256, 256),
        ImageSize::Portrait => (192, 256),
    }
}

fn color_from_prompt(prompt: &str, style: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(style.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn render_png(width: u32, height: u32, color: (u8, u8, u8)) -> Result<Vec<u8>, GenerationError> {
    let (r, g, b) = color;
    let image = RgbImage::from_pixel(width, height, Rgb([r, g, b]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| GenerationError::TransientFailure(format!("dryrun encode failed: {err}")))?;
    Ok(bytes)
}

#[async_trait]
impl ImageGenerator for DryrunGenerator {
    fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    async fn generate(&self, call: &GenerateCall) -> Result<GeneratedImage, GenerationError> {
        let (width, height) = dims(call.size);
        let bytes = render_png(
            width,
            height,
            color_from_prompt(&call.prompt, call.style.as_str()),
        )?;
        Ok(GeneratedImage {
            bytes,
            mime_type: Some("image/png".to_string()),
        })
    }
}
