use crate::config::DynamicPricingConfig;
use crate::types::ModelPricing;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Ultra-generic fallback when a model is unknown everywhere, per 1k tokens.
const GENERIC_INPUT_PER_1K: f64 = 0.001;
const GENERIC_OUTPUT_PER_1K: f64 = 0.002;

/// TTL-refreshed model price table with a hardcoded fallback.
///
/// `get_pricing` is synchronous and never blocks on the network: a stale or
/// missing entry triggers at most one background refresh while the caller is
/// served from the stale cache or the hardcoded table.
#[derive(Debug)]
pub struct PricingCache {
    state: Arc<PricingState>,
    config: DynamicPricingConfig,
    overrides: HashMap<String, (f64, f64)>,
    client: reqwest::Client,
}

#[derive(Debug, Default)]
struct PricingState {
    entries: RwLock<HashMap<String, ModelPricing>>,
    last_fetch: RwLock<Option<chrono::DateTime<Utc>>>,
    fetching: AtomicBool,
}

#[derive(Debug, Deserialize)]
struct PricingFeed {
    data: Vec<PricingFeedModel>,
}

#[derive(Debug, Deserialize)]
struct PricingFeedModel {
    id: String,
    pricing: PricingFeedPrices,
}

#[derive(Debug, Deserialize)]
struct PricingFeedPrices {
    prompt: String,
    completion: String,
}

impl PricingCache {
    pub fn new(
        config: DynamicPricingConfig,
        overrides: HashMap<String, crate::config::StaticPrice>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();

        Self {
            state: Arc::new(PricingState::default()),
            config,
            overrides: overrides
                .into_iter()
                .map(|(model, price)| (model, (price.input_per_1k, price.output_per_1k)))
                .collect(),
            client,
        }
    }

    /// Current pricing for a model. Never fails and never blocks; may return
    /// stale or fallback data while a refresh is in flight.
    pub fn get_pricing(&self, model: &str) -> ModelPricing {
        if !self.config.enabled {
            return self.fallback_pricing(model);
        }

        let now = Utc::now();
        let ttl = chrono::Duration::milliseconds(self.config.ttl_ms as i64);

        let cached = self
            .state
            .entries
            .read()
            .ok()
            .and_then(|map| map.get(model).copied());
        if let Some(entry) = cached {
            if now - entry.fetched_at <= ttl {
                return entry;
            }
        }

        let stale = self
            .state
            .last_fetch
            .read()
            .ok()
            .map(|guard| match *guard {
                Some(at) => now - at > ttl,
                None => true,
            })
            .unwrap_or(false);
        if stale {
            self.spawn_refresh();
        }

        cached.unwrap_or_else(|| self.fallback_pricing(model))
    }

    /// Hardcoded table lookup, honoring static config overrides first.
    pub fn fallback_pricing(&self, model: &str) -> ModelPricing {
        let (input_per_1k, output_per_1k) = self
            .overrides
            .get(model)
            .copied()
            .unwrap_or_else(|| hardcoded_pricing(model));

        ModelPricing {
            input_per_1k,
            output_per_1k,
            fetched_at: Utc::now(),
        }
    }

    fn spawn_refresh(&self) {
        if self
            .state
            .fetching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return; // one refresh at a time
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.state.fetching.store(false, Ordering::SeqCst);
            return;
        };

        let state = Arc::clone(&self.state);
        let client = self.client.clone();
        let config = self.config.clone();
        handle.spawn(async move {
            if let Err(e) = refresh(&client, &config, &state).await {
                warn!("pricing refresh failed: {}", e);
            }
            state.fetching.store(false, Ordering::SeqCst);
        });
    }
}

/// Fetch the price feed and fold accepted entries into the cache. Errors are
/// reported, never propagated; the cache keeps its prior state.
async fn refresh(
    client: &reqwest::Client,
    config: &DynamicPricingConfig,
    state: &PricingState,
) -> crate::error::Result<()> {
    debug!(url = %config.api_url, "refreshing model pricing");

    let response = client.get(&config.api_url).send().await?;
    if !response.status().is_success() {
        return Err(crate::error::SlimclawError::PricingRefresh(format!(
            "pricing endpoint returned {}",
            response.status()
        )));
    }

    let feed: PricingFeed = response.json().await?;
    let accepted = apply_feed(config, state, feed);

    if let Ok(mut last) = state.last_fetch.write() {
        *last = Some(Utc::now());
    }

    debug!(models = accepted, "pricing cache refreshed");
    Ok(())
}

fn apply_feed(config: &DynamicPricingConfig, state: &PricingState, feed: PricingFeed) -> usize {
    let now = Utc::now();
    let mut accepted = 0;

    let mut entries = match state.entries.write() {
        Ok(guard) => guard,
        Err(_) => return 0,
    };

    for model in feed.data {
        let relevant = config
            .relevant_providers
            .iter()
            .any(|p| model.id.starts_with(&format!("{}/", p)));
        if !relevant {
            continue;
        }

        let (Ok(prompt), Ok(completion)) = (
            model.pricing.prompt.parse::<f64>(),
            model.pricing.completion.parse::<f64>(),
        ) else {
            continue;
        };

        // Feed prices are per token; the cache stores per 1k.
        let input_per_1k = prompt * 1000.0;
        let output_per_1k = completion * 1000.0;
        if input_per_1k <= 0.0 || output_per_1k <= 0.0 {
            continue;
        }

        entries.insert(
            model.id,
            ModelPricing {
                input_per_1k,
                output_per_1k,
                fetched_at: now,
            },
        );
        accepted += 1;
    }

    accepted
}

/// Built-in price table, per 1k tokens. Matched on name fragments so dated
/// model ids resolve without an exhaustive list.
fn hardcoded_pricing(model: &str) -> (f64, f64) {
    let name = model.to_lowercase();

    if name.contains("haiku") {
        (0.00025, 0.00125)
    } else if name.contains("sonnet") {
        (0.003, 0.015)
    } else if name.contains("opus") {
        (0.015, 0.075)
    } else if name.contains("gpt-4o-mini") {
        (0.00015, 0.0006)
    } else if name.contains("gpt-4o") {
        (0.005, 0.015)
    } else if name.contains("gpt-4.1-nano") {
        (0.0001, 0.0004)
    } else if name.contains("gpt-4.1") {
        (0.002, 0.008)
    } else if name.contains("o4-mini") {
        (0.0011, 0.0044)
    } else if name.contains("o3") {
        (0.002, 0.008)
    } else if name.contains("gemini-2.5-pro") {
        (0.00125, 0.01)
    } else if name.contains("flash") {
        (0.000075, 0.0003)
    } else if name.contains("deepseek") {
        (0.00027, 0.0011)
    } else if name.contains("llama") {
        (0.0002, 0.0006)
    } else if name.contains("qwen") {
        (0.0002, 0.0006)
    } else {
        (GENERIC_INPUT_PER_1K, GENERIC_OUTPUT_PER_1K)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(enabled: bool) -> PricingCache {
        let config = DynamicPricingConfig {
            enabled,
            ..DynamicPricingConfig::default()
        };
        PricingCache::new(config, HashMap::new())
    }

    #[test]
    fn disabled_cache_returns_hardcoded() {
        let cache = cache(false);
        let pricing = cache.get_pricing("anthropic/claude-3-haiku-20240307");
        assert_eq!(pricing.input_per_1k, 0.00025);
        assert_eq!(pricing.output_per_1k, 0.00125);
    }

    #[test]
    fn unknown_model_gets_generic_default() {
        let cache = cache(false);
        let pricing = cache.get_pricing("somevendor/mystery");
        assert_eq!(pricing.input_per_1k, GENERIC_INPUT_PER_1K);
        assert_eq!(pricing.output_per_1k, GENERIC_OUTPUT_PER_1K);
    }

    #[test]
    fn pricing_is_always_positive() {
        let cache = cache(false);
        for model in [
            "anthropic/claude-opus-4-20250514",
            "openai/o3",
            "google/gemini-2.0-flash",
            "",
            "weird model name",
        ] {
            let pricing = cache.get_pricing(model);
            assert!(pricing.input_per_1k > 0.0, "model {:?}", model);
            assert!(pricing.output_per_1k > 0.0, "model {:?}", model);
        }
    }

    #[test]
    fn static_overrides_win_over_hardcoded() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "anthropic/claude-3-haiku-20240307".to_string(),
            crate::config::StaticPrice {
                input_per_1k: 0.0005,
                output_per_1k: 0.002,
            },
        );
        let cache = PricingCache::new(DynamicPricingConfig::default(), overrides);

        let pricing = cache.get_pricing("anthropic/claude-3-haiku-20240307");
        assert_eq!(pricing.input_per_1k, 0.0005);
    }

    #[test]
    fn feed_filters_and_converts() {
        let cache = cache(true);
        let feed = PricingFeed {
            data: vec![
                PricingFeedModel {
                    id: "anthropic/claude-3-haiku-20240307".to_string(),
                    pricing: PricingFeedPrices {
                        prompt: "0.00000025".to_string(),
                        completion: "0.00000125".to_string(),
                    },
                },
                PricingFeedModel {
                    id: "irrelevant/model".to_string(),
                    pricing: PricingFeedPrices {
                        prompt: "0.001".to_string(),
                        completion: "0.001".to_string(),
                    },
                },
                PricingFeedModel {
                    id: "openai/free-model".to_string(),
                    pricing: PricingFeedPrices {
                        prompt: "0".to_string(),
                        completion: "0".to_string(),
                    },
                },
                PricingFeedModel {
                    id: "openai/bad-numbers".to_string(),
                    pricing: PricingFeedPrices {
                        prompt: "not-a-number".to_string(),
                        completion: "0.001".to_string(),
                    },
                },
            ],
        };

        let accepted = apply_feed(&cache.config, &cache.state, feed);
        assert_eq!(accepted, 1);

        let entries = cache.state.entries.read().unwrap();
        let entry = entries.get("anthropic/claude-3-haiku-20240307").unwrap();
        assert!((entry.input_per_1k - 0.00025).abs() < 1e-12);
        assert!((entry.output_per_1k - 0.00125).abs() < 1e-12);
    }

    #[test]
    fn fresh_entry_is_served_from_cache() {
        let cache = cache(true);
        cache.state.entries.write().unwrap().insert(
            "openai/gpt-4o".to_string(),
            ModelPricing {
                input_per_1k: 0.004,
                output_per_1k: 0.012,
                fetched_at: Utc::now(),
            },
        );

        let pricing = cache.get_pricing("openai/gpt-4o");
        assert_eq!(pricing.input_per_1k, 0.004);
    }
}
