use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::common::{ProviderHttp, copy_parameters, non_empty_str, parameter_or};
use crate::image::ImageAdapter;
use crate::types::{ImageReference, Task};
use crate::{ImagegenError, Result};

pub const MINIMAX_IMAGE_MODEL: &str = "image-01";
pub const MINIMAX_PARAMETERS: &[&str] = &["aspect_ratio", "width", "height", "seed", "prompt_optimizer"];

#[derive(Clone, Debug)]
pub struct Minimax {
    client: ProviderHttp,
    model: String,
}

impl Minimax {
    pub fn new(client: ProviderHttp) -> Self {
        Self {
            client,
            model: MINIMAX_IMAGE_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Minimax answers 200 for business errors; `base_resp.status_code` is the
    /// real verdict.
    fn parse_image(value: &Value) -> Result<ImageReference> {
        let status_code = value.pointer("/base_resp/status_code").and_then(Value::as_i64);
        if status_code == Some(0) {
            if let Some(url) = non_empty_str(value, "/data/image_urls/0") {
                return Ok(ImageReference::url(url));
            }
        }
        let base_resp = value.get("base_resp").cloned().unwrap_or(Value::Null);
        Err(ImagegenError::GenerationFailed(format!(
            "minimax generation failed: {base_resp}"
        )))
    }
}

#[async_trait]
impl ImageAdapter for Minimax {
    fn provider(&self) -> &str {
        self.client.id()
    }

    async fn generate(&self, task: &Task, _cancel: &CancellationToken) -> Result<ImageReference> {
        let api_key = self.client.api_key()?;

        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(self.model.clone()));
        body.insert("prompt".to_string(), Value::String(task.prompt.clone()));
        body.insert(
            "aspect_ratio".to_string(),
            parameter_or(task, "aspect_ratio", "1:1"),
        );
        body.insert("n".to_string(), Value::Number(1.into()));
        body.insert("response_format".to_string(), Value::String("url".to_string()));
        copy_parameters(&mut body, task, MINIMAX_PARAMETERS);

        let req = self
            .client
            .http()
            .post(self.client.endpoint("v1/image_generation"))
            .bearer_auth(api_key)
            .json(&body);
        let response = self.client.send(req).await?;
        let value = self.client.read_json(response).await?;
        Self::parse_image(&value)
    }
}
