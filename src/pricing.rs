use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;

use crate::config::PricingConfig;
use crate::models::{Cost, UsageMetrics};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const TOKENS_PER_MILLION: f64 = 1_000_000.0;

/// Rates in price per million tokens.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cached_per_million: f64,
}

/// Remote catalog shape: `{updated_at, prices: [{id, input, output, input_cached}]}`.
#[derive(Debug, Deserialize)]
struct RemoteCatalog {
    #[serde(default)]
    updated_at: String,
    #[serde(default)]
    prices: Vec<RemotePriceEntry>,
}

#[derive(Debug, Deserialize)]
struct RemotePriceEntry {
    id: String,
    #[serde(default)]
    input: f64,
    #[serde(default)]
    output: f64,
    #[serde(default)]
    input_cached: Option<f64>,
}

/// Local fallback shape: `{model: {input_price_per_million, …}}`.
#[derive(Debug, Deserialize)]
struct FallbackPriceEntry {
    #[serde(default)]
    input_price_per_million: f64,
    #[serde(default)]
    output_price_per_million: f64,
    #[serde(default)]
    cached_price_per_million: f64,
}

/// Model pricing catalog with a background refresher. Both maps are swapped
/// atomically under their locks; a failed refresh leaves the previous
/// catalog intact.
pub struct PricingService {
    remote_url: String,
    fallback_file: String,
    prices: RwLock<HashMap<String, ModelPricing>>,
    aliases: RwLock<HashMap<String, String>>,
    http: reqwest::Client,
    refresher: std::sync::Mutex<Option<tokio::task::AbortHandle>>,
}

impl PricingService {
    /// Loads aliases and the initial catalog (remote first, local fallback),
    /// then starts the periodic refresher.
    pub async fn start(config: &PricingConfig) -> std::sync::Arc<Self> {
        let service = std::sync::Arc::new(Self {
            remote_url: config.remote_url.clone(),
            fallback_file: config.fallback_file.clone(),
            prices: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            http: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
            refresher: std::sync::Mutex::new(None),
        });

        service.load_aliases(&config.aliases_file);
        service.load_initial().await;

        if !service.remote_url.is_empty() && config.refresh_interval_secs > 0 {
            let refresh = std::sync::Arc::clone(&service);
            let interval = Duration::from_secs(config.refresh_interval_secs);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(err) = refresh.fetch_remote().await {
                        tracing::warn!(error = %err, "failed to refresh pricing");
                    }
                }
            });
            *service.refresher.lock().expect("refresher lock poisoned") = Some(handle.abort_handle());
        }

        service
    }

    /// Builds a service with fixed maps and no refresher.
    pub fn with_catalog(
        prices: HashMap<String, ModelPricing>,
        aliases: HashMap<String, String>,
    ) -> Self {
        Self {
            remote_url: String::new(),
            fallback_file: String::new(),
            prices: RwLock::new(prices),
            aliases: RwLock::new(aliases),
            http: reqwest::Client::new(),
            refresher: std::sync::Mutex::new(None),
        }
    }

    /// Prices a usage metric. The model resolves against the catalog
    /// directly, then through the alias map; a miss returns zero costs with
    /// `model_alias_found = false`.
    pub fn calculate(&self, metrics: &UsageMetrics) -> Cost {
        let pricing = {
            let prices = self.prices.read().expect("pricing lock poisoned");
            match prices.get(&metrics.model) {
                Some(pricing) => Some(*pricing),
                None => {
                    let aliases = self.aliases.read().expect("alias lock poisoned");
                    aliases
                        .get(&metrics.model)
                        .and_then(|canonical| prices.get(canonical))
                        .copied()
                }
            }
        };

        let Some(pricing) = pricing else {
            tracing::warn!(model = %metrics.model, "no pricing found for model");
            return Cost::default();
        };

        let fresh_input = (metrics.input_tokens - metrics.cached_tokens) as f64
            * pricing.input_per_million
            / TOKENS_PER_MILLION;
        let cached_input =
            metrics.cached_tokens as f64 * pricing.cached_per_million / TOKENS_PER_MILLION;
        let input_cost = fresh_input + cached_input;
        let output_cost =
            metrics.output_tokens as f64 * pricing.output_per_million / TOKENS_PER_MILLION;

        Cost {
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
            model_alias_found: true,
        }
    }

    /// Stops the background refresher.
    pub fn close(&self) {
        if let Some(handle) = self
            .refresher
            .lock()
            .expect("refresher lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    fn load_aliases(&self, aliases_file: &str) {
        if aliases_file.is_empty() {
            return;
        }
        let raw = match std::fs::read_to_string(aliases_file) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(file = aliases_file, error = %err, "failed to load model aliases");
                return;
            }
        };
        match serde_json::from_str::<HashMap<String, String>>(&raw) {
            Ok(aliases) => {
                tracing::info!(count = aliases.len(), "loaded model aliases");
                *self.aliases.write().expect("alias lock poisoned") = aliases;
            }
            Err(err) => tracing::error!(error = %err, "failed to parse model aliases"),
        }
    }

    async fn load_initial(&self) {
        if self.remote_url.is_empty() {
            self.load_fallback();
            return;
        }
        if let Err(err) = self.fetch_remote().await {
            tracing::warn!(error = %err, "failed to fetch remote pricing, using fallback");
            self.load_fallback();
        }
    }

    async fn fetch_remote(&self) -> crate::Result<()> {
        let raw = self
            .http
            .get(&self.remote_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let (prices, updated_at) = parse_remote_catalog(&raw)?;
        tracing::info!(models = prices.len(), updated_at = %updated_at, "loaded pricing data from remote");
        *self.prices.write().expect("pricing lock poisoned") = prices;
        Ok(())
    }

    fn load_fallback(&self) {
        if self.fallback_file.is_empty() {
            return;
        }
        let raw = match std::fs::read_to_string(&self.fallback_file) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!(file = %self.fallback_file, error = %err, "failed to load fallback pricing");
                return;
            }
        };
        match parse_fallback_catalog(&raw) {
            Ok(prices) => {
                tracing::info!(models = prices.len(), "loaded pricing data from fallback");
                *self.prices.write().expect("pricing lock poisoned") = prices;
            }
            Err(err) => tracing::error!(error = %err, "failed to parse fallback pricing"),
        }
    }
}

impl Drop for PricingService {
    fn drop(&mut self) {
        self.close();
    }
}

fn parse_remote_catalog(
    raw: &str,
) -> Result<(HashMap<String, ModelPricing>, String), serde_json::Error> {
    let catalog: RemoteCatalog = serde_json::from_str(raw)?;
    let mut prices = HashMap::with_capacity(catalog.prices.len());
    for entry in catalog.prices {
        prices.insert(
            entry.id,
            ModelPricing {
                input_per_million: entry.input,
                output_per_million: entry.output,
                cached_per_million: entry.input_cached.unwrap_or(0.0),
            },
        );
    }
    Ok((prices, catalog.updated_at))
}

fn parse_fallback_catalog(raw: &str) -> Result<HashMap<String, ModelPricing>, serde_json::Error> {
    let entries: HashMap<String, FallbackPriceEntry> = serde_json::from_str(raw)?;
    Ok(entries
        .into_iter()
        .map(|(model, entry)| {
            (
                model,
                ModelPricing {
                    input_per_million: entry.input_price_per_million,
                    output_per_million: entry.output_price_per_million,
                    cached_per_million: entry.cached_price_per_million,
                },
            )
        })
        .collect())
}
