//! Provider client resolution and caching
//!
//! A [`ClientManager`] maps model identifiers to provider families and
//! keeps one live client handle per family. Managers are plain values
//! owned by their caller; concurrent sessions each own their own manager
//! rather than sharing one behind a lock.

use async_openai::{config::OpenAIConfig, Client};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::info;

use crate::error::{LlmError, Result};

/// Group of models sharing one API endpoint and credential scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderFamily {
    OpenAi,
    DeepSeek,
}

impl ProviderFamily {
    /// Determine the provider family from a model identifier.
    ///
    /// Unknown identifiers are a configuration error, not a call failure.
    pub fn for_model(model: &str) -> Result<Self> {
        if model.contains("deepseek") {
            return Ok(Self::DeepSeek);
        }
        let openai = ["gpt-", "chatgpt-", "o1", "o3", "o4"];
        if openai.iter().any(|prefix| model.starts_with(prefix)) {
            return Ok(Self::OpenAi);
        }
        Err(LlmError::configuration(format!(
            "unknown model id `{model}`: expected a deepseek model or an OpenAI model \
             (gpt-*, chatgpt-*, o1*, o3*, o4*)"
        )))
    }

    /// Environment variable holding the credential for this family
    pub fn credential_var(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::DeepSeek => "DEEPSEEK_API_KEY",
        }
    }

    /// Base endpoint override, where the family is not the default OpenAI API
    pub fn api_base(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => None,
            Self::DeepSeek => Some("https://api.deepseek.com"),
        }
    }
}

/// Cache of live provider clients, keyed by family.
///
/// A request for a model in an already-seen family reuses the cached
/// handle; the first request for a new family constructs its client,
/// failing with a configuration error if the credential is absent from
/// the environment.
#[derive(Debug, Default)]
pub struct ClientManager {
    clients: HashMap<ProviderFamily, Client<OpenAIConfig>>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a model identifier to a live client for its provider family
    pub fn resolve(&mut self, model: &str) -> Result<&Client<OpenAIConfig>> {
        let family = ProviderFamily::for_model(model)?;
        match self.clients.entry(family) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let client = build_client(family)?;
                info!(?family, %model, "constructed provider client");
                Ok(entry.insert(client))
            }
        }
    }

    /// Number of live clients (one per family seen so far)
    pub fn live_clients(&self) -> usize {
        self.clients.len()
    }
}

fn build_client(family: ProviderFamily) -> Result<Client<OpenAIConfig>> {
    let var = family.credential_var();
    let api_key = std::env::var(var).map_err(|_| {
        LlmError::configuration(format!(
            "{var} environment variable is required for {family:?} models"
        ))
    })?;

    let mut config = OpenAIConfig::new().with_api_key(api_key);
    if let Some(base) = family.api_base() {
        config = config.with_api_base(base);
    }
    // Provider-side retries stay off; the retry engine is the only retry path.
    Ok(Client::with_config(config))
}
