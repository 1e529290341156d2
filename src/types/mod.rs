use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorKind;

/// Provider-specific optional knobs (`size`, `aspect_ratio`, `negative_prompt`, ...).
pub type Parameters = Map<String, Value>;

pub const DEFAULT_PROVIDER: &str = "dalle";

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

/// One "generate an image" request. Knobs sit next to `prompt` and `provider`
/// on the wire: `{"prompt":"a cat","provider":"reve","aspect_ratio":"16:9"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub prompt: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(flatten)]
    pub parameters: Parameters,
}

impl Task {
    pub fn new(prompt: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            provider: provider.into(),
            parameters: Parameters::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key).filter(|value| !value.is_null())
    }

    /// Lookup key into the provider registry.
    pub fn provider_id(&self) -> String {
        normalize_provider_id(&self.provider)
    }
}

pub fn normalize_provider_id(provider: &str) -> String {
    provider.trim().to_ascii_lowercase()
}

/// Where a generated image can be fetched from. Callers get an opaque string
/// and must not assume either form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ImageReference {
    Url(String),
    DataUri { media_type: String, data: String },
}

impl ImageReference {
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url(url.into())
    }

    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::DataUri {
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    pub fn as_url(&self) -> Option<&str> {
        match self {
            Self::Url(url) => Some(url),
            Self::DataUri { .. } => None,
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::DataUri { media_type, data } => write!(f, "data:{media_type};base64,{data}"),
        }
    }
}

impl From<ImageReference> for String {
    fn from(reference: ImageReference) -> Self {
        reference.to_string()
    }
}

impl From<String> for ImageReference {
    fn from(raw: String) -> Self {
        let parsed = raw
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(";base64,"))
            .map(|(media_type, data)| Self::base64(media_type, data));
        parsed.unwrap_or(Self::Url(raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Success,
    Failed,
}

/// Outcome of one task. Exactly one of `image` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub prompt: String,
    pub provider: String,
    pub status: TaskStatus,
    #[serde(rename = "imageUrl", default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl TaskResult {
    pub fn success(task: &Task, provider: impl Into<String>, image: ImageReference) -> Self {
        Self {
            prompt: task.prompt.clone(),
            provider: provider.into(),
            status: TaskStatus::Success,
            image: Some(image),
            error: None,
            error_kind: None,
        }
    }

    pub fn failure(
        task: &Task,
        provider: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            prompt: task.prompt.clone(),
            provider: provider.into(),
            status: TaskStatus::Failed,
            image: None,
            error: Some(message.into()),
            error_kind: Some(kind),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// How the single post-batch debit went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Accounting {
    Charged,
    /// The ledger declined the debit (balance moved since the pre-flight check).
    Rejected,
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total_tasks: usize,
    pub successful: usize,
    pub failed: usize,
    pub credits_requested: u64,
    /// Owed for the successful tasks, whether or not the debit went through.
    pub credits_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits_remaining: Option<u64>,
    pub accounting: Accounting,
    pub results: Vec<TaskResult>,
}

impl BatchReport {
    /// What the ledger actually took: `credits_used` when the debit was
    /// applied, zero when it was rejected or failed.
    pub fn credits_charged(&self) -> u64 {
        match self.accounting {
            Accounting::Charged => self.credits_used,
            Accounting::Rejected | Accounting::Failed { .. } => 0,
        }
    }
}
