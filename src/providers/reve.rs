use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::common::{ProviderHttp, copy_parameters, non_empty_str, parameter_or};
use crate::image::ImageAdapter;
use crate::types::{ImageReference, Task};
use crate::{ImagegenError, Result};

pub const REVE_PARAMETERS: &[&str] = &["aspect_ratio", "version"];

#[derive(Clone, Debug)]
pub struct Reve {
    client: ProviderHttp,
}

impl Reve {
    pub fn new(client: ProviderHttp) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageAdapter for Reve {
    fn provider(&self) -> &str {
        self.client.id()
    }

    async fn generate(&self, task: &Task, _cancel: &CancellationToken) -> Result<ImageReference> {
        let api_key = self.client.api_key()?;

        let mut body = Map::<String, Value>::new();
        body.insert("prompt".to_string(), Value::String(task.prompt.clone()));
        body.insert(
            "aspect_ratio".to_string(),
            parameter_or(task, "aspect_ratio", "1:1"),
        );
        body.insert("version".to_string(), parameter_or(task, "version", "latest"));
        copy_parameters(&mut body, task, REVE_PARAMETERS);

        let req = self
            .client
            .http()
            .post(self.client.endpoint("v1/image/create"))
            .bearer_auth(api_key)
            .header("accept", "application/json")
            .json(&body);
        let response = self.client.send(req).await?;
        let value = self.client.read_json(response).await?;

        let image = non_empty_str(&value, "/image").ok_or_else(|| {
            ImagegenError::InvalidResponse(format!("reve response has no image: {value}"))
        })?;
        Ok(ImageReference::base64("image/png", image))
    }
}
