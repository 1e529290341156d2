use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::common::{ProviderHttp, copy_parameters, non_empty_str, parameter_or};
use crate::image::ImageAdapter;
use crate::poll::{AsyncJobHandle, PollDriver, PollSource, PollStatus};
use crate::types::{ImageReference, Task};
use crate::{ImagegenError, Result};

pub const BFL_PARAMETERS: &[&str] = &[
    "aspect_ratio",
    "width",
    "height",
    "seed",
    "steps",
    "guidance",
    "prompt_upsampling",
    "safety_tolerance",
    "output_format",
];

const TERMINAL_FAILURES: &[&str] = &[
    "Error",
    "Failed",
    "Request Moderated",
    "Content Moderated",
    "Task not found",
];

/// Black Forest Labs FLUX: submit a job, then poll its `polling_url` until
/// the sample is ready.
#[derive(Clone, Debug)]
pub struct BflFlux {
    client: ProviderHttp,
    model_endpoint: String,
    driver: PollDriver,
}

impl BflFlux {
    pub fn new(client: ProviderHttp, model_endpoint: impl Into<String>) -> Self {
        Self {
            client,
            model_endpoint: model_endpoint.into(),
            driver: PollDriver::default(),
        }
    }

    pub fn with_driver(mut self, driver: PollDriver) -> Self {
        self.driver = driver;
        self
    }

    async fn submit(&self, task: &Task, api_key: &str) -> Result<Value> {
        let mut body = Map::<String, Value>::new();
        body.insert("prompt".to_string(), Value::String(task.prompt.clone()));
        body.insert(
            "aspect_ratio".to_string(),
            parameter_or(task, "aspect_ratio", "1:1"),
        );
        copy_parameters(&mut body, task, BFL_PARAMETERS);

        let req = self
            .client
            .http()
            .post(self.client.endpoint(&format!("v1/{}", self.model_endpoint)))
            .header("x-key", api_key)
            .header("accept", "application/json")
            .json(&body);
        let response = self.client.send(req).await?;
        self.client.read_json(response).await
    }
}

struct BflPoller<'a> {
    client: &'a ProviderHttp,
    api_key: &'a str,
}

#[async_trait]
impl PollSource for BflPoller<'_> {
    async fn poll(&self, handle: &AsyncJobHandle) -> Result<PollStatus> {
        let req = self
            .client
            .http()
            .get(&handle.polling_url)
            .header("x-key", self.api_key)
            .header("accept", "application/json");
        let response = self.client.send(req).await?;
        let value = self.client.read_json(response).await?;

        let status = value
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if status == "Ready" {
            return Ok(PollStatus::Ready(
                value.get("result").cloned().unwrap_or(Value::Null),
            ));
        }
        if TERMINAL_FAILURES.contains(&status.as_str()) {
            return Ok(PollStatus::Failed(value));
        }
        Ok(PollStatus::Pending(status))
    }
}

#[async_trait]
impl ImageAdapter for BflFlux {
    fn provider(&self) -> &str {
        self.client.id()
    }

    async fn generate(&self, task: &Task, cancel: &CancellationToken) -> Result<ImageReference> {
        let api_key = self.client.api_key()?;

        let submitted = self.submit(task, api_key).await?;
        let handle = self
            .driver
            .submitted(non_empty_str(&submitted, "/polling_url"))
            .map_err(|err| match err {
                ImagegenError::Protocol(message) => {
                    ImagegenError::Protocol(format!("{message}: {submitted}"))
                }
                other => other,
            })?;

        let poller = BflPoller {
            client: &self.client,
            api_key,
        };
        let result = self.driver.drive(&poller, &handle, cancel).await?;

        let sample = non_empty_str(&result, "/sample").ok_or_else(|| {
            ImagegenError::InvalidResponse(format!("bfl result has no sample url: {result}"))
        })?;
        Ok(ImageReference::url(sample))
    }
}
