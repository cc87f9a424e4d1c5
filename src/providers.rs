use crate::config::ProxyConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

pub const DEFAULT_PROVIDER: &str = "openrouter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderSource {
    TierProviders,
    Native,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResolution {
    pub provider: String,
    pub source: ProviderSource,
    pub matched_pattern: Option<String>,
}

/// Map a model id to a provider through the configured glob table.
///
/// Match order: exact key, `prefix/*` glob, the `*` wildcard, then the native
/// provider inferred from the segment before the first `/`, then the default.
/// Only `*` and `prefix/*` globs are supported.
pub fn resolve_provider(
    model_id: &str,
    tier_providers: &HashMap<String, String>,
) -> ProviderResolution {
    if let Some(provider) = tier_providers.get(model_id) {
        return ProviderResolution {
            provider: provider.clone(),
            source: ProviderSource::TierProviders,
            matched_pattern: Some(model_id.to_string()),
        };
    }

    for (pattern, provider) in tier_providers {
        let Some(prefix) = pattern.strip_suffix("/*") else {
            continue;
        };
        if model_id.starts_with(&format!("{}/", prefix)) {
            return ProviderResolution {
                provider: provider.clone(),
                source: ProviderSource::TierProviders,
                matched_pattern: Some(pattern.clone()),
            };
        }
    }

    if let Some(provider) = tier_providers.get("*") {
        return ProviderResolution {
            provider: provider.clone(),
            source: ProviderSource::TierProviders,
            matched_pattern: Some("*".to_string()),
        };
    }

    if let Some((prefix, _)) = model_id.split_once('/') {
        if !prefix.is_empty() {
            return ProviderResolution {
                provider: prefix.to_string(),
                source: ProviderSource::Native,
                matched_pattern: None,
            };
        }
    }

    ProviderResolution {
        provider: DEFAULT_PROVIDER.to_string(),
        source: ProviderSource::Default,
        matched_pattern: None,
    }
}

#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub base_url: String,
    pub api_key: String,
}

/// Process-wide provider credential map, resolved once at startup from the
/// proxy config plus the environment.
#[derive(Debug, Default)]
pub struct CredentialMap {
    entries: HashMap<String, ProviderCredentials>,
}

impl CredentialMap {
    pub fn from_config(proxy: &ProxyConfig) -> Self {
        let mut entries = HashMap::new();

        // Known providers get sensible defaults; overrides fill or replace.
        let known: &[(&str, &str, &str)] = &[
            ("openrouter", "https://openrouter.ai/api", "OPENROUTER_API_KEY"),
            ("openai", "https://api.openai.com", "OPENAI_API_KEY"),
            ("anthropic", "https://api.anthropic.com", "ANTHROPIC_API_KEY"),
            ("google", "https://generativelanguage.googleapis.com", "GOOGLE_API_KEY"),
        ];

        for (provider, default_url, default_env) in known {
            let overrides = proxy.provider_overrides.get(*provider);
            let base_url = overrides
                .and_then(|o| o.base_url.clone())
                .unwrap_or_else(|| default_url.to_string());
            let api_key = overrides
                .and_then(|o| o.api_key.clone())
                .or_else(|| {
                    let env_name = overrides
                        .and_then(|o| o.api_key_env.clone())
                        .unwrap_or_else(|| default_env.to_string());
                    std::env::var(env_name).ok()
                })
                .filter(|k| !k.is_empty());

            if let Some(api_key) = api_key {
                entries.insert(provider.to_string(), ProviderCredentials { base_url, api_key });
            }
        }

        // Providers configured only through overrides
        for (provider, overrides) in &proxy.provider_overrides {
            if entries.contains_key(provider) {
                continue;
            }
            let Some(base_url) = overrides.base_url.clone() else {
                continue;
            };
            let api_key = overrides
                .api_key
                .clone()
                .or_else(|| {
                    overrides
                        .api_key_env
                        .as_deref()
                        .and_then(|env_name| std::env::var(env_name).ok())
                })
                .filter(|k| !k.is_empty());
            if let Some(api_key) = api_key {
                entries.insert(provider.clone(), ProviderCredentials { base_url, api_key });
            }
        }

        debug!(providers = entries.len(), "resolved provider credentials");
        Self { entries }
    }

    pub fn get(&self, provider: &str) -> Option<&ProviderCredentials> {
        self.entries.get(provider)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
