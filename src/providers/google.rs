use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use super::common::{ProviderHttp, non_empty_str};
use crate::image::ImageAdapter;
use crate::types::{ImageReference, Task};
use crate::{ImagegenError, Result};

pub const GEMINI_IMAGE_MODEL: &str = "gemini-2.5-flash-image-preview";
pub const IMAGEN_ULTRA_MODEL: &str = "imagen-4.0-ultra-generate-001";

/// Task knob -> Imagen `parameters` field.
const IMAGEN_PARAMETERS: &[(&str, &str)] = &[
    ("aspect_ratio", "aspectRatio"),
    ("image_size", "imageSize"),
    ("negative_prompt", "negativePrompt"),
    ("person_generation", "personGeneration"),
    ("seed", "seed"),
];

/// Gemini `generateContent` with image output; the image comes back as an
/// `inlineData` part.
#[derive(Clone, Debug)]
pub struct GeminiImage {
    client: ProviderHttp,
    model: String,
}

impl GeminiImage {
    pub fn new(client: ProviderHttp) -> Self {
        Self {
            client,
            model: GEMINI_IMAGE_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn build_body(task: &Task) -> Value {
        let mut generation_config = json!({ "responseModalities": ["IMAGE"] });
        if let Some(aspect_ratio) = task.parameter("aspect_ratio") {
            generation_config["imageConfig"] = json!({ "aspectRatio": aspect_ratio });
        }
        json!({
            "contents": [{ "parts": [{ "text": task.prompt }] }],
            "generationConfig": generation_config,
        })
    }

    fn parse_image(value: &Value) -> Result<ImageReference> {
        let parts = value
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ImagegenError::InvalidResponse(format!("gemini response has no candidates: {value}"))
            })?;

        let inline = parts
            .iter()
            .find_map(|part| part.get("inlineData"))
            .ok_or_else(|| {
                ImagegenError::InvalidResponse("no image data found in gemini response".to_string())
            })?;
        let data = non_empty_str(inline, "/data").ok_or_else(|| {
            ImagegenError::InvalidResponse("gemini inlineData has no data".to_string())
        })?;
        let media_type = non_empty_str(inline, "/mimeType").unwrap_or("image/png");
        Ok(ImageReference::base64(media_type, data))
    }
}

#[async_trait]
impl ImageAdapter for GeminiImage {
    fn provider(&self) -> &str {
        self.client.id()
    }

    async fn generate(&self, task: &Task, _cancel: &CancellationToken) -> Result<ImageReference> {
        let api_key = self.client.api_key()?;
        let url = self
            .client
            .endpoint(&format!("v1beta/models/{}:generateContent", self.model));

        let req = self
            .client
            .http()
            .post(url)
            .query(&[("key", api_key)])
            .json(&Self::build_body(task));
        let response = self.client.send(req).await?;
        let value = self.client.read_json(response).await?;
        Self::parse_image(&value)
    }
}

/// Imagen `:predict`; the image comes back as `bytesBase64Encoded`.
#[derive(Clone, Debug)]
pub struct Imagen {
    client: ProviderHttp,
    model: String,
}

impl Imagen {
    pub fn new(client: ProviderHttp) -> Self {
        Self {
            client,
            model: IMAGEN_ULTRA_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn build_body(task: &Task) -> Value {
        let mut parameters = Map::<String, Value>::new();
        parameters.insert("sampleCount".to_string(), Value::Number(1.into()));
        for (knob, field) in IMAGEN_PARAMETERS {
            if let Some(value) = task.parameter(knob) {
                parameters.insert((*field).to_string(), value.clone());
            }
        }
        json!({
            "instances": [{ "prompt": task.prompt }],
            "parameters": parameters,
        })
    }
}

#[async_trait]
impl ImageAdapter for Imagen {
    fn provider(&self) -> &str {
        self.client.id()
    }

    async fn generate(&self, task: &Task, _cancel: &CancellationToken) -> Result<ImageReference> {
        let api_key = self.client.api_key()?;
        let url = self
            .client
            .endpoint(&format!("v1beta/models/{}:predict", self.model));

        let req = self
            .client
            .http()
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&Self::build_body(task));
        let response = self.client.send(req).await?;
        let value = self.client.read_json(response).await?;

        let prediction = value.pointer("/predictions/0").ok_or_else(|| {
            // Safety filters drop the prediction instead of returning an error.
            ImagegenError::GenerationFailed(format!("imagen returned no predictions: {value}"))
        })?;
        let data = non_empty_str(prediction, "/bytesBase64Encoded").ok_or_else(|| {
            ImagegenError::InvalidResponse(format!("imagen prediction has no image bytes: {prediction}"))
        })?;
        let media_type = non_empty_str(prediction, "/mimeType").unwrap_or("image/png");
        Ok(ImageReference::base64(media_type, data))
    }
}
