use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::common::{
    ProviderHttp, copy_parameters, media_type_for_format, non_empty_str, parameter_or,
};
use crate::image::ImageAdapter;
use crate::types::{ImageReference, Task};
use crate::{ImagegenError, Result};

pub const DALLE_MODEL: &str = "dall-e-3";
pub const GPT_IMAGE_MODEL: &str = "gpt-image-1";

pub const DALLE_PARAMETERS: &[&str] = &["size", "quality", "style"];
pub const GPT_IMAGE_PARAMETERS: &[&str] = &[
    "size",
    "quality",
    "background",
    "output_format",
    "output_compression",
    "moderation",
];
pub const SEEDREAM_PARAMETERS: &[&str] = &["size", "seed", "watermark", "guidance_scale"];
pub const RECRAFT_PARAMETERS: &[&str] = &["size", "style", "substyle", "negative_prompt"];
pub const TOGETHER_PARAMETERS: &[&str] = &["width", "height", "steps", "seed", "negative_prompt"];

/// `POST {base}/images/generations`: OpenAI itself and the hosts that copy
/// its images API (BytePlus Ark, Recraft, Together).
#[derive(Clone, Debug)]
pub struct OpenAIImages {
    client: ProviderHttp,
    model: String,
    response_format: Option<&'static str>,
    parameters: &'static [&'static str],
    defaults: &'static [(&'static str, &'static str)],
}

impl OpenAIImages {
    pub fn new(client: ProviderHttp, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            response_format: Some("url"),
            parameters: &["size"],
            defaults: &[],
        }
    }

    pub fn dalle(client: ProviderHttp) -> Self {
        Self::new(client, DALLE_MODEL)
            .with_parameters(DALLE_PARAMETERS)
            .with_defaults(&[("size", "1024x1024")])
    }

    /// gpt-image-1 always answers with base64 and rejects `response_format`.
    pub fn gpt_image(client: ProviderHttp) -> Self {
        Self::new(client, GPT_IMAGE_MODEL)
            .with_response_format(None)
            .with_parameters(GPT_IMAGE_PARAMETERS)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_response_format(mut self, format: Option<&'static str>) -> Self {
        self.response_format = format;
        self
    }

    pub fn with_parameters(mut self, parameters: &'static [&'static str]) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_defaults(mut self, defaults: &'static [(&'static str, &'static str)]) -> Self {
        self.defaults = defaults;
        self
    }

    fn build_body(&self, task: &Task) -> Map<String, Value> {
        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(self.model.clone()));
        body.insert("prompt".to_string(), Value::String(task.prompt.clone()));
        body.insert("n".to_string(), Value::Number(1.into()));
        if let Some(format) = self.response_format {
            body.insert(
                "response_format".to_string(),
                Value::String(format.to_string()),
            );
        }
        for (key, default) in self.defaults {
            body.insert((*key).to_string(), parameter_or(task, key, default));
        }
        copy_parameters(&mut body, task, self.parameters);
        body
    }

    fn parse_image(&self, task: &Task, value: &Value) -> Result<ImageReference> {
        if let Some(url) = non_empty_str(value, "/data/0/url") {
            return Ok(ImageReference::url(url));
        }
        if let Some(data) = non_empty_str(value, "/data/0/b64_json") {
            let format = task.parameter("output_format").and_then(Value::as_str);
            return Ok(ImageReference::base64(media_type_for_format(format), data));
        }
        Err(ImagegenError::InvalidResponse(format!(
            "{} response has neither data[0].url nor data[0].b64_json: {value}",
            self.client.id()
        )))
    }
}

#[async_trait]
impl ImageAdapter for OpenAIImages {
    fn provider(&self) -> &str {
        self.client.id()
    }

    async fn generate(&self, task: &Task, _cancel: &CancellationToken) -> Result<ImageReference> {
        let api_key = self.client.api_key()?;
        let body = self.build_body(task);

        let req = self
            .client
            .http()
            .post(self.client.endpoint("images/generations"))
            .bearer_auth(api_key)
            .json(&body);
        let response = self.client.send(req).await?;
        let value = self.client.read_json(response).await?;
        self.parse_image(task, &value)
    }
}
