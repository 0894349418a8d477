//! Model price table. The local `llm_info` table wins; misses fall back to
//! a periodically fetched remote catalog. Rates are USD per million tokens,
//! so every cost formula carries a 1e-6 factor.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{info, warn};

use crate::protocol::Usage;
use crate::store::{LlmPrice, Store};
use crate::{RelayError, Result};

const CATALOG_URL: &str = "https://models.dev/api.json";

/// Providers lifted from the remote catalog; everything else is ignored.
const PROVIDERS: &[&str] = &[
    "openai",
    "anthropic",
    "google",
    "deepseek",
    "xai",
    "alibaba",
    "zhipuai",
    "minimax",
    "moonshotai",
    "v0",
];

pub struct PriceTable {
    store: Store,
    local: RwLock<HashMap<String, LlmPrice>>,
    remote: RwLock<HashMap<String, LlmPrice>>,
    last_update: RwLock<Option<Instant>>,
}

impl PriceTable {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            local: RwLock::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
            last_update: RwLock::new(None),
        }
    }

    pub async fn load_local(&self) -> Result<()> {
        let prices = self.store.load_llm_prices().await?;
        let mut local = self.local.write().expect("price cache poisoned");
        local.clear();
        for (model, price) in prices {
            local.insert(model, price);
        }
        Ok(())
    }

    pub fn get(&self, model: &str) -> Option<LlmPrice> {
        if let Some(price) = self
            .local
            .read()
            .expect("price cache poisoned")
            .get(model)
            .copied()
        {
            return Some(price);
        }
        self.remote
            .read()
            .expect("price cache poisoned")
            .get(&model.to_lowercase())
            .copied()
    }

    pub async fn set_local(&self, model: String, price: LlmPrice) -> Result<()> {
        self.store.upsert_llm_price(model.clone(), price).await?;
        self.local
            .write()
            .expect("price cache poisoned")
            .insert(model, price);
        Ok(())
    }

    pub async fn delete_local(&self, model: String) -> Result<()> {
        self.store.delete_llm_price(model.clone()).await?;
        self.local.write().expect("price cache poisoned").remove(&model);
        Ok(())
    }

    pub fn last_update(&self) -> Option<Instant> {
        *self.last_update.read().expect("price cache poisoned")
    }

    /// Fetches the remote catalog when the refresh interval has elapsed.
    pub async fn update_remote_if_due(&self, client: &reqwest::Client, interval: Duration) {
        let due = self
            .last_update()
            .map(|at| at.elapsed() >= interval)
            .unwrap_or(true);
        if !due {
            return;
        }
        match self.update_remote(client).await {
            Ok(count) => info!(models = count, "model price catalog updated"),
            Err(err) => warn!(%err, "failed to update model price catalog"),
        }
    }

    pub async fn update_remote(&self, client: &reqwest::Client) -> Result<usize> {
        let response = client.get(CATALOG_URL).send().await?;
        if !response.status().is_success() {
            return Err(RelayError::Upstream {
                status: response.status().as_u16(),
                body: "failed to fetch model price catalog".to_string(),
            });
        }
        let raw: HashMap<String, CatalogProvider> = response.json().await?;

        let mut parsed = HashMap::new();
        for provider in PROVIDERS {
            let Some(entry) = raw.get(*provider) else { continue };
            for model in entry.models.values() {
                parsed.insert(model.id.to_lowercase(), model.cost);
            }
        }
        let count = parsed.len();
        *self.remote.write().expect("price cache poisoned") = parsed;
        *self.last_update.write().expect("price cache poisoned") = Some(Instant::now());
        Ok(count)
    }
}

#[derive(Debug, Deserialize, Default)]
struct CatalogProvider {
    #[serde(default)]
    models: HashMap<String, CatalogModel>,
}

#[derive(Debug, Deserialize)]
struct CatalogModel {
    id: String,
    #[serde(default)]
    cost: LlmPrice,
}

/// Prices a response's usage. Anthropic usage counts every prompt token at
/// the input rate plus cache writes at the write rate and cache reads at the
/// read rate; everyone else has cached tokens carved out of the prompt
/// before the input rate applies.
pub fn price_usage(usage: &Usage, price: &LlmPrice) -> (f64, f64) {
    let cached = usage.cached_tokens() as f64;
    let prompt = usage.prompt_tokens as f64;
    let completion = usage.completion_tokens as f64;

    let input_cost = if usage.anthropic_usage {
        (cached * price.cache_read
            + prompt * price.input
            + usage.cache_creation_input_tokens as f64 * price.cache_write)
            * 1e-6
    } else {
        (cached * price.cache_read + (prompt - cached) * price.input) * 1e-6
    };
    let output_cost = completion * price.output * 1e-6;
    (input_cost, output_cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PromptTokensDetails;

    fn usage(prompt: i64, cached: i64, completion: i64) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            prompt_tokens_details: (cached > 0).then_some(PromptTokensDetails {
                cached_tokens: cached,
            }),
            ..Usage::default()
        }
    }

    #[test]
    fn cached_tokens_are_carved_out_of_the_input_rate() {
        let price = LlmPrice {
            input: 2.0,
            output: 4.0,
            cache_read: 1.0,
            cache_write: 3.0,
        };
        let (input_cost, output_cost) = price_usage(&usage(100, 20, 50), &price);
        assert!((input_cost - 1.80e-4).abs() < 1e-12);
        assert!((output_cost - 2.00e-4).abs() < 1e-12);
    }

    #[test]
    fn anthropic_usage_prices_all_prompt_tokens_plus_cache_writes() {
        let price = LlmPrice {
            input: 2.0,
            output: 4.0,
            cache_read: 1.0,
            cache_write: 3.0,
        };
        let mut metered = usage(100, 20, 50);
        metered.anthropic_usage = true;
        metered.cache_creation_input_tokens = 10;
        let (input_cost, _) = price_usage(&metered, &price);
        assert!((input_cost - 2.50e-4).abs() < 1e-12);
    }

    #[test]
    fn no_cached_tokens_means_plain_input_rate() {
        let price = LlmPrice {
            input: 2.0,
            output: 4.0,
            cache_read: 1.0,
            cache_write: 3.0,
        };
        let (input_cost, output_cost) = price_usage(&usage(100, 0, 10), &price);
        assert!((input_cost - 2.0e-4).abs() < 1e-12);
        assert!((output_cost - 4.0e-5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn local_table_wins_over_remote_catalog() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path().join("price.db"));
        store.init().await.expect("init");
        let table = PriceTable::new(store);
        table.load_local().await.expect("load");

        assert!(table.get("claude-3-5-sonnet").is_none());
        table
            .set_local(
                "claude-3-5-sonnet".to_string(),
                LlmPrice {
                    input: 3.0,
                    output: 15.0,
                    cache_read: 0.3,
                    cache_write: 3.75,
                },
            )
            .await
            .expect("set");
        let price = table.get("claude-3-5-sonnet").expect("price");
        assert!((price.output - 15.0).abs() < f64::EPSILON);
    }
}
