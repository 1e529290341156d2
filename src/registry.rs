//! Process-wide provider table: descriptor (id, credit cost, capability) plus
//! the adapter that serves it. Built once at start-up, read-only afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, EngineConfig, Env};
use crate::image::ImageAdapter;
use crate::poll::PollDriver;
use crate::providers::openai_images::{
    RECRAFT_PARAMETERS, SEEDREAM_PARAMETERS, TOGETHER_PARAMETERS,
};
use crate::providers::{
    BflFlux, GeminiImage, Ideogram, Imagen, Minimax, OpenAIImages, ProviderHttp, Reve,
    StabilityCore,
};
use crate::types::normalize_provider_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// One request/response round trip with a fixed set of knobs.
    Synchronous,
    /// Submit, then poll for the result.
    AsyncPoll,
    /// One round trip that forwards a provider-specific set of knobs.
    PassthroughParams,
}

impl Capability {
    pub fn is_async(self) -> bool {
        matches!(self, Self::AsyncPoll)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub credit_cost: u64,
    pub capability: Capability,
}

#[derive(Debug, Clone, Copy)]
enum Family {
    OpenAi(OpenAiFlavor),
    Reve,
    Gemini,
    Imagen,
    Minimax,
    Ideogram,
    Stability,
    Bfl(&'static str),
}

#[derive(Debug, Clone, Copy)]
enum OpenAiFlavor {
    Dalle,
    GptImage,
    Compatible {
        model: &'static str,
        parameters: &'static [&'static str],
    },
}

struct Builtin {
    id: &'static str,
    credit_cost: u64,
    capability: Capability,
    key_env: &'static str,
    base_url: &'static str,
    family: Family,
}

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const BFL_BASE_URL: &str = "https://api.bfl.ai";

const BUILTINS: &[Builtin] = &[
    Builtin {
        id: "dalle",
        credit_cost: 10,
        capability: Capability::PassthroughParams,
        key_env: "OPENAI_API_KEY",
        base_url: OPENAI_BASE_URL,
        family: Family::OpenAi(OpenAiFlavor::Dalle),
    },
    Builtin {
        id: "gpt-image-1",
        credit_cost: 11,
        capability: Capability::PassthroughParams,
        key_env: "OPENAI_API_KEY",
        base_url: OPENAI_BASE_URL,
        family: Family::OpenAi(OpenAiFlavor::GptImage),
    },
    Builtin {
        id: "seedream-4",
        credit_cost: 8,
        capability: Capability::PassthroughParams,
        key_env: "ARK_API_KEY",
        base_url: "https://ark.ap-southeast.bytepluses.com/api/v3",
        family: Family::OpenAi(OpenAiFlavor::Compatible {
            model: "seedream-4-0-250828",
            parameters: SEEDREAM_PARAMETERS,
        }),
    },
    Builtin {
        id: "recraft-v3",
        credit_cost: 7,
        capability: Capability::PassthroughParams,
        key_env: "RECRAFT_API_TOKEN",
        base_url: "https://external.api.recraft.ai/v1",
        family: Family::OpenAi(OpenAiFlavor::Compatible {
            model: "recraftv3",
            parameters: RECRAFT_PARAMETERS,
        }),
    },
    Builtin {
        id: "flux-schnell",
        credit_cost: 5,
        capability: Capability::PassthroughParams,
        key_env: "TOGETHER_API_KEY",
        base_url: "https://api.together.xyz/v1",
        family: Family::OpenAi(OpenAiFlavor::Compatible {
            model: "black-forest-labs/FLUX.1-schnell",
            parameters: TOGETHER_PARAMETERS,
        }),
    },
    Builtin {
        id: "reve",
        credit_cost: 6,
        capability: Capability::Synchronous,
        key_env: "REVE_API_KEY",
        base_url: "https://api.reve.com",
        family: Family::Reve,
    },
    Builtin {
        id: "gemini",
        credit_cost: 5,
        capability: Capability::Synchronous,
        key_env: "GEMINI_API_KEY",
        base_url: GEMINI_BASE_URL,
        family: Family::Gemini,
    },
    Builtin {
        id: "imagen-4-ultra",
        credit_cost: 12,
        capability: Capability::PassthroughParams,
        key_env: "GEMINI_API_KEY",
        base_url: GEMINI_BASE_URL,
        family: Family::Imagen,
    },
    Builtin {
        id: "minimax",
        credit_cost: 7,
        capability: Capability::Synchronous,
        key_env: "MINIMAX_API_KEY",
        base_url: "https://api.minimax.io",
        family: Family::Minimax,
    },
    Builtin {
        id: "ideogram-v3",
        credit_cost: 9,
        capability: Capability::PassthroughParams,
        key_env: "IDEOGRAM_API_KEY",
        base_url: "https://api.ideogram.ai",
        family: Family::Ideogram,
    },
    Builtin {
        id: "stability-core",
        credit_cost: 6,
        capability: Capability::PassthroughParams,
        key_env: "STABILITY_API_KEY",
        base_url: "https://api.stability.ai",
        family: Family::Stability,
    },
    Builtin {
        id: "flux-kontext",
        credit_cost: 8,
        capability: Capability::AsyncPoll,
        key_env: "BFL_API_KEY",
        base_url: BFL_BASE_URL,
        family: Family::Bfl("flux-kontext-pro"),
    },
    Builtin {
        id: "flux-dev",
        credit_cost: 6,
        capability: Capability::AsyncPoll,
        key_env: "BFL_API_KEY",
        base_url: BFL_BASE_URL,
        family: Family::Bfl("flux-dev"),
    },
    Builtin {
        id: "flux-pro",
        credit_cost: 7,
        capability: Capability::AsyncPoll,
        key_env: "BFL_API_KEY",
        base_url: BFL_BASE_URL,
        family: Family::Bfl("flux-pro-1.1"),
    },
];

/// Descriptors of every built-in provider, with their default costs.
pub fn builtin_descriptors() -> Vec<ProviderDescriptor> {
    BUILTINS
        .iter()
        .map(|builtin| ProviderDescriptor {
            id: builtin.id.to_string(),
            credit_cost: builtin.credit_cost,
            capability: builtin.capability,
        })
        .collect()
}

#[derive(Clone)]
pub struct RegisteredProvider {
    descriptor: ProviderDescriptor,
    adapter: Arc<dyn ImageAdapter>,
}

impl RegisteredProvider {
    pub fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    pub fn adapter(&self) -> &Arc<dyn ImageAdapter> {
        &self.adapter
    }
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, RegisteredProvider>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.providers.values().map(|p| &p.descriptor))
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in provider, with credentials from `env` and overrides
    /// from `config`. Providers without a credential are still registered;
    /// their tasks fail with a configuration error.
    pub fn from_config(config: &EngineConfig, env: &Env) -> Result<Self, ConfigError> {
        for id in config.providers.keys() {
            let id = normalize_provider_id(id);
            if !BUILTINS
                .iter()
                .any(|builtin| normalize_provider_id(builtin.id) == id)
            {
                return Err(ConfigError::Invalid(format!(
                    "providers.{id} does not name a known provider"
                )));
            }
        }

        let driver = PollDriver::new(config.poll_interval(), config.poll_deadline());
        let mut registry = Self::new();
        for builtin in BUILTINS {
            let overrides = config.provider(builtin.id).cloned().unwrap_or_default();

            let key_envs = if overrides.api_key_env.is_empty() {
                vec![builtin.key_env.to_string()]
            } else {
                overrides.api_key_env.clone()
            };
            let base_url = overrides
                .base_url
                .as_deref()
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(builtin.base_url);
            let http = ProviderHttp::with_timeout(
                builtin.id,
                base_url,
                key_envs.join(" or "),
                config.sync_timeout(),
            )?
            .with_api_key(env.first_of(&key_envs));

            let model = overrides.model.filter(|model| !model.trim().is_empty());
            let adapter = build_adapter(builtin.family, http, model, driver);
            let descriptor = ProviderDescriptor {
                id: builtin.id.to_string(),
                credit_cost: overrides.credit_cost.unwrap_or(builtin.credit_cost),
                capability: builtin.capability,
            };
            registry.register_arc(descriptor, adapter)?;
        }

        tracing::debug!(providers = registry.providers.len(), "provider registry built");
        Ok(registry)
    }

    pub fn register(
        &mut self,
        descriptor: ProviderDescriptor,
        adapter: impl ImageAdapter + 'static,
    ) -> Result<(), ConfigError> {
        self.register_arc(descriptor, Arc::new(adapter))
    }

    pub fn register_arc(
        &mut self,
        mut descriptor: ProviderDescriptor,
        adapter: Arc<dyn ImageAdapter>,
    ) -> Result<(), ConfigError> {
        descriptor.id = normalize_provider_id(&descriptor.id);
        if descriptor.id.is_empty() {
            return Err(ConfigError::Invalid("provider id must not be empty".to_string()));
        }
        if descriptor.credit_cost == 0 {
            return Err(ConfigError::Invalid(format!(
                "provider {} must cost at least one credit",
                descriptor.id
            )));
        }
        self.providers.insert(
            descriptor.id.clone(),
            RegisteredProvider {
                descriptor,
                adapter,
            },
        );
        Ok(())
    }

    /// Case-insensitive lookup.
    pub fn resolve(&self, provider: &str) -> Option<&RegisteredProvider> {
        self.providers.get(&normalize_provider_id(provider))
    }

    pub fn descriptor(&self, provider: &str) -> Option<&ProviderDescriptor> {
        self.resolve(provider).map(RegisteredProvider::descriptor)
    }

    pub fn credit_cost(&self, provider: &str) -> Option<u64> {
        self.descriptor(provider).map(|descriptor| descriptor.credit_cost)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.providers.values().map(RegisteredProvider::descriptor)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn build_adapter(
    family: Family,
    http: ProviderHttp,
    model: Option<String>,
    driver: PollDriver,
) -> Arc<dyn ImageAdapter> {
    match family {
        Family::OpenAi(flavor) => {
            let adapter = match flavor {
                OpenAiFlavor::Dalle => OpenAIImages::dalle(http),
                OpenAiFlavor::GptImage => OpenAIImages::gpt_image(http),
                OpenAiFlavor::Compatible { model, parameters } => {
                    OpenAIImages::new(http, model).with_parameters(parameters)
                }
            };
            match model {
                Some(model) => Arc::new(adapter.with_model(model)),
                None => Arc::new(adapter),
            }
        }
        Family::Reve => Arc::new(Reve::new(http)),
        Family::Gemini => {
            let adapter = GeminiImage::new(http);
            match model {
                Some(model) => Arc::new(adapter.with_model(model)),
                None => Arc::new(adapter),
            }
        }
        Family::Imagen => {
            let adapter = Imagen::new(http);
            match model {
                Some(model) => Arc::new(adapter.with_model(model)),
                None => Arc::new(adapter),
            }
        }
        Family::Minimax => {
            let adapter = Minimax::new(http);
            match model {
                Some(model) => Arc::new(adapter.with_model(model)),
                None => Arc::new(adapter),
            }
        }
        Family::Ideogram => Arc::new(Ideogram::new(http)),
        Family::Stability => Arc::new(StabilityCore::new(http)),
        Family::Bfl(endpoint) => {
            let endpoint = model.unwrap_or_else(|| endpoint.to_string());
            Arc::new(BflFlux::new(http, endpoint).with_driver(driver))
        }
    }
}
