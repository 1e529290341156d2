use std::time::Duration;

use serde_json::{Map, Value};

use crate::config::DEFAULT_SYNC_TIMEOUT_SECS;
use crate::types::Task;
use crate::{ImagegenError, Result};

pub(crate) fn join_endpoint(base_url: &str, endpoint: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let endpoint = endpoint.trim_start_matches('/');
    if base.ends_with(&format!("/{endpoint}")) {
        base.to_string()
    } else {
        format!("{base}/{endpoint}")
    }
}

/// Connection details shared by every HTTP adapter: one client with a fixed
/// timeout, a base URL, and the credential resolved at start-up.
#[derive(Clone)]
pub struct ProviderHttp {
    id: String,
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    api_key: Option<String>,
    key_env: String,
}

impl std::fmt::Debug for ProviderHttp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHttp")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ProviderHttp {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        key_env: impl Into<String>,
    ) -> std::result::Result<Self, reqwest::Error> {
        Self::with_timeout(
            id,
            base_url,
            key_env,
            Duration::from_secs(DEFAULT_SYNC_TIMEOUT_SECS),
        )
    }

    pub fn with_timeout(
        id: impl Into<String>,
        base_url: impl Into<String>,
        key_env: impl Into<String>,
        timeout: Duration,
    ) -> std::result::Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            id: id.into(),
            http,
            base_url: base_url.into(),
            timeout,
            api_key: None,
            key_env: key_env.into(),
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Missing credentials fail here, before any request is built.
    pub(crate) fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ImagegenError::Configuration {
                provider: self.id.clone(),
                key: self.key_env.clone(),
            })
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        join_endpoint(&self.base_url, path)
    }

    pub(crate) async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        request.send().await.map_err(|err| self.transport_error(err))
    }

    pub(crate) fn transport_error(&self, err: reqwest::Error) -> ImagegenError {
        if err.is_timeout() {
            ImagegenError::Timeout(format!(
                "{} did not respond within {:?}",
                self.id, self.timeout
            ))
        } else {
            ImagegenError::from(err)
        }
    }

    pub(crate) async fn read_json(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| self.transport_error(err))?;
        if !status.is_success() {
            return Err(ImagegenError::Api { status, body });
        }
        serde_json::from_str(&body).map_err(|source| ImagegenError::MalformedJson { source, body })
    }
}

/// Copies the allowed task parameters into a request body, never overriding
/// fields the adapter already set.
pub(crate) fn copy_parameters(body: &mut Map<String, Value>, task: &Task, allowed: &[&str]) {
    for key in allowed {
        if body.contains_key(*key) {
            continue;
        }
        if let Some(value) = task.parameter(key) {
            body.insert((*key).to_string(), value.clone());
        }
    }
}

pub(crate) fn parameter_or(task: &Task, key: &str, default: &str) -> Value {
    task.parameter(key)
        .cloned()
        .unwrap_or_else(|| Value::String(default.to_string()))
}

pub(crate) fn non_empty_str<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

pub(crate) fn form_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn media_type_for_format(format: Option<&str>) -> &'static str {
    match format.map(|f| f.trim().to_ascii_lowercase()).as_deref() {
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}
