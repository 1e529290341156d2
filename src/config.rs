use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::normalize_provider_id;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;
pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_POLL_DEADLINE_SECS: u64 = 90;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Credential lookup: dotenv entries first, then the process environment.
#[derive(Clone)]
pub struct Env {
    pub dotenv: BTreeMap<String, String>,
    inherit_process: bool,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            dotenv: BTreeMap::new(),
            inherit_process: true,
        }
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.dotenv.keys().map(|key| key.as_str()).collect();
        f.debug_struct("Env")
            .field("dotenv_keys", &keys)
            .field("inherit_process", &self.inherit_process)
            .finish()
    }
}

impl Env {
    pub fn parse_dotenv(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
            inherit_process: true,
        }
    }

    /// Only the given entries are visible; the process environment is ignored.
    pub fn isolated(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            dotenv: entries.into_iter().collect(),
            inherit_process: false,
        }
    }

    pub async fn from_dotenv_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::parse_dotenv(&contents))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.dotenv.get(key) {
            return Some(value.clone());
        }
        if !self.inherit_process {
            return None;
        }
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    pub fn first_of(&self, keys: &[String]) -> Option<String> {
        keys.iter().find_map(|key| self.get(key))
    }
}

pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line).trim();
        let Some((raw_key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = raw_key.trim();
        if key.is_empty() {
            continue;
        }

        let mut value = raw_value.trim().to_string();
        if let Some(stripped) = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        {
            value = stripped.to_string();
        }

        if value.trim().is_empty() {
            continue;
        }

        out.insert(key.to_string(), value);
    }

    out
}

/// Per-provider overrides applied when the registry is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_cost: Option<u64>,
    /// Environment keys tried in order for the provider credential.
    #[serde(default, skip_serializing_if = "Vec::is_empty", alias = "keys")]
    pub api_key_env: Vec<String>,
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_sync_timeout_secs() -> u64 {
    DEFAULT_SYNC_TIMEOUT_SECS
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_poll_deadline_secs() -> u64 {
    DEFAULT_POLL_DEADLINE_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_deadline_secs")]
    pub poll_deadline_secs: u64,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderOverride>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            sync_timeout_secs: DEFAULT_SYNC_TIMEOUT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            poll_deadline_secs: DEFAULT_POLL_DEADLINE_SECS,
            providers: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(raw)?;
        config.providers = std::mem::take(&mut config.providers)
            .into_iter()
            .map(|(id, provider)| (normalize_provider_id(&id), provider))
            .collect();
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync_timeout_secs must be positive".to_string(),
            ));
        }
        if self.poll_deadline_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_deadline_secs must be positive".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.poll_interval_secs > self.poll_deadline_secs {
            return Err(ConfigError::Invalid(format!(
                "poll_interval_secs ({}) must not exceed poll_deadline_secs ({})",
                self.poll_interval_secs, self.poll_deadline_secs
            )));
        }
        for (id, provider) in &self.providers {
            if provider.credit_cost == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "providers.{id}.credit_cost must be positive"
                )));
            }
        }
        Ok(())
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.max(1)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_deadline(&self) -> Duration {
        Duration::from_secs(self.poll_deadline_secs)
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderOverride> {
        let id = normalize_provider_id(id);
        self.providers.get(&id).or_else(|| {
            self.providers
                .iter()
                .find(|(key, _)| normalize_provider_id(key) == id)
                .map(|(_, provider)| provider)
        })
    }
}
