use async_trait::async_trait;
use reqwest::multipart::Form;
use tokio_util::sync::CancellationToken;

use super::common::{ProviderHttp, form_text, non_empty_str};
use crate::image::ImageAdapter;
use crate::types::{ImageReference, Task};
use crate::{ImagegenError, Result};

pub const IDEOGRAM_PARAMETERS: &[&str] = &[
    "aspect_ratio",
    "resolution",
    "rendering_speed",
    "magic_prompt",
    "negative_prompt",
    "style_type",
    "seed",
];

/// Ideogram v3 takes `multipart/form-data` and answers with hosted URLs.
#[derive(Clone, Debug)]
pub struct Ideogram {
    client: ProviderHttp,
}

impl Ideogram {
    pub fn new(client: ProviderHttp) -> Self {
        Self { client }
    }

    fn build_form(task: &Task) -> Form {
        let mut form = Form::new()
            .text("prompt", task.prompt.clone())
            .text("num_images", "1");
        for key in IDEOGRAM_PARAMETERS {
            if let Some(value) = task.parameter(key) {
                form = form.text(*key, form_text(value));
            }
        }
        form
    }
}

#[async_trait]
impl ImageAdapter for Ideogram {
    fn provider(&self) -> &str {
        self.client.id()
    }

    async fn generate(&self, task: &Task, _cancel: &CancellationToken) -> Result<ImageReference> {
        let api_key = self.client.api_key()?;

        let req = self
            .client
            .http()
            .post(self.client.endpoint("v1/ideogram-v3/generate"))
            .header("Api-Key", api_key)
            .multipart(Self::build_form(task));
        let response = self.client.send(req).await?;
        let value = self.client.read_json(response).await?;

        if value.pointer("/data/0/is_image_safe").and_then(|v| v.as_bool()) == Some(false) {
            return Err(ImagegenError::GenerationFailed(
                "ideogram flagged the generated image as unsafe".to_string(),
            ));
        }
        let url = non_empty_str(&value, "/data/0/url").ok_or_else(|| {
            ImagegenError::InvalidResponse(format!("ideogram response has no image url: {value}"))
        })?;
        Ok(ImageReference::url(url))
    }
}
