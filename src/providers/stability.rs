use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::multipart::Form;
use tokio_util::sync::CancellationToken;

use super::common::{ProviderHttp, form_text, media_type_for_format};
use crate::image::ImageAdapter;
use crate::types::{ImageReference, Task};
use crate::{ImagegenError, Result};

pub const STABILITY_PARAMETERS: &[&str] = &[
    "aspect_ratio",
    "negative_prompt",
    "seed",
    "style_preset",
    "output_format",
];

/// Stable Image Core. Asked for `image/*`, it answers with raw image bytes,
/// which are wrapped into a data URI here.
#[derive(Clone, Debug)]
pub struct StabilityCore {
    client: ProviderHttp,
}

impl StabilityCore {
    pub fn new(client: ProviderHttp) -> Self {
        Self { client }
    }

    fn build_form(task: &Task) -> Form {
        let mut form = Form::new().text("prompt", task.prompt.clone());
        for key in STABILITY_PARAMETERS {
            if let Some(value) = task.parameter(key) {
                form = form.text(*key, form_text(value));
            }
        }
        form
    }
}

#[async_trait]
impl ImageAdapter for StabilityCore {
    fn provider(&self) -> &str {
        self.client.id()
    }

    async fn generate(&self, task: &Task, _cancel: &CancellationToken) -> Result<ImageReference> {
        let api_key = self.client.api_key()?;

        let req = self
            .client
            .http()
            .post(self.client.endpoint("v2beta/stable-image/generate/core"))
            .bearer_auth(api_key)
            .header("accept", "image/*")
            .multipart(Self::build_form(task));
        let response = self.client.send(req).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|err| self.client.transport_error(err))?;
            return Err(ImagegenError::Api { status, body });
        }

        let finish_reason = response
            .headers()
            .get("finish-reason")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        if finish_reason.as_deref() == Some("CONTENT_FILTERED") {
            return Err(ImagegenError::GenerationFailed(
                "stability filtered the generated image".to_string(),
            ));
        }

        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .filter(|value| value.starts_with("image/"))
            .map(str::to_string)
            .unwrap_or_else(|| {
                let format = task.parameter("output_format").and_then(|v| v.as_str());
                media_type_for_format(format).to_string()
            });

        let bytes = response
            .bytes()
            .await
            .map_err(|err| self.client.transport_error(err))?;
        if bytes.is_empty() {
            return Err(ImagegenError::InvalidResponse(
                "stability returned an empty image body".to_string(),
            ));
        }
        Ok(ImageReference::base64(media_type, STANDARD.encode(&bytes)))
    }
}
