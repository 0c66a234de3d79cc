pub mod api_keys;
pub mod proxy_keys;

mod active_keys;
mod hll;
mod s3;

pub use active_keys::ActiveKeysCache;
pub use hll::HllEngine;
pub use s3::{BodyUpload, S3BodyStore};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::{MetadataConfig, PostgresConfig};
use crate::models::{ApiKey, ProviderMapping, ProxyKey, RequestLog};
use crate::Result;

/// Bounded log queue; rows past the cap are dropped, never blocked on.
const LOG_QUEUE_CAPACITY: usize = 1000;

/// Store dependency of the operator-key resolver.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>>;
    async fn bump_api_key_usage(&self, id: Uuid) -> Result<()>;
}

/// Store dependency of the proxy-key resolver.
#[async_trait]
pub trait ProxyKeyStore: Send + Sync {
    async fn proxy_key_by_hash(&self, key_hash: &str) -> Result<Option<ProxyKey>>;
    async fn provider_mapping(
        &self,
        proxy_key_id: Uuid,
        provider: &str,
    ) -> Result<Option<ProviderMapping>>;
    async fn bump_proxy_key_usage(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
impl ApiKeyStore for PgPool {
    async fn api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>> {
        api_keys::get_by_hash(self, key_hash).await
    }

    async fn bump_api_key_usage(&self, id: Uuid) -> Result<()> {
        api_keys::bump_usage(self, id).await
    }
}

#[async_trait]
impl ProxyKeyStore for PgPool {
    async fn proxy_key_by_hash(&self, key_hash: &str) -> Result<Option<ProxyKey>> {
        proxy_keys::get_by_hash(self, key_hash).await
    }

    async fn provider_mapping(
        &self,
        proxy_key_id: Uuid,
        provider: &str,
    ) -> Result<Option<ProviderMapping>> {
        proxy_keys::get_provider_mapping(self, proxy_key_id, provider).await
    }

    async fn bump_proxy_key_usage(&self, id: Uuid) -> Result<()> {
        proxy_keys::bump_usage(self, id).await
    }
}

/// Opens the connection pool. Every query in the process goes through it.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_conns)
        .connect(&config.dsn())
        .await?;
    Ok(pool)
}

/// Opens the pool without dialing the server; connections are established on
/// first use.
pub fn connect_lazy(config: &PostgresConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_conns)
        .connect_lazy(&config.dsn())?;
    Ok(pool)
}

/// Request-log persistence: a bounded queue drained by a single writer that
/// splits metadata, inserts the row, and feeds the HLL engine.
pub struct Storage {
    pool: PgPool,
    active_keys: Arc<ActiveKeysCache>,
    hll: Arc<HllEngine>,
    log_tx: std::sync::Mutex<Option<tokio::sync::mpsc::Sender<RequestLog>>>,
    writer: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Storage {
    pub fn new(pool: PgPool, metadata: &MetadataConfig) -> Self {
        let active_keys = Arc::new(ActiveKeysCache::new(
            pool.clone(),
            Duration::from_secs(metadata.active_keys_cache_ttl_secs),
        ));
        let hll = HllEngine::new(
            pool.clone(),
            Duration::from_secs(metadata.hll_flush_interval_secs),
        );

        let (log_tx, log_rx) = tokio::sync::mpsc::channel(LOG_QUEUE_CAPACITY);
        let writer = tokio::spawn(write_loop(
            log_rx,
            pool.clone(),
            Arc::clone(&active_keys),
            Arc::clone(&hll),
        ));

        Self {
            pool,
            active_keys,
            hll,
            log_tx: std::sync::Mutex::new(Some(log_tx)),
            writer: tokio::sync::Mutex::new(Some(writer)),
        }
    }

    /// Reloads persisted HLL sketches. Call once at startup; failures are
    /// tolerable (estimates restart conservatively).
    pub async fn load_hll_state(&self) -> Result<usize> {
        self.hll.load_from_store().await
    }

    /// Enqueues a log row without blocking. A full queue drops the row with
    /// a warning.
    pub fn write_request_log(&self, row: RequestLog) {
        let sender = self.log_tx.lock().expect("log sender lock poisoned");
        let Some(tx) = sender.as_ref() else {
            tracing::warn!(request_id = %row.id, "log sink closed, dropping log");
            return;
        };
        if let Err(tokio::sync::mpsc::error::TrySendError::Full(row)) = tx.try_send(row) {
            tracing::warn!(request_id = %row.id, "request log queue full, dropping log");
        }
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn active_keys(&self) -> &ActiveKeysCache {
        &self.active_keys
    }

    /// Drains the log queue, then flushes HLL state one last time. The pool
    /// stays open for any still-draining collaborators; `close_pool` ends it.
    pub async fn shutdown(&self) {
        let sender = self.log_tx.lock().expect("log sender lock poisoned").take();
        drop(sender);
        if let Some(writer) = self.writer.lock().await.take() {
            if let Err(err) = writer.await {
                tracing::warn!(error = %err, "log writer exited abnormally");
            }
        }
        self.hll.stop().await;
    }

    pub async fn close_pool(&self) {
        self.pool.close().await;
    }
}

async fn write_loop(
    mut rx: tokio::sync::mpsc::Receiver<RequestLog>,
    pool: PgPool,
    active_keys: Arc<ActiveKeysCache>,
    hll: Arc<HllEngine>,
) {
    // recv yields the buffered backlog after every sender is dropped, so
    // shutdown drains the queue before the loop ends.
    while let Some(row) = rx.recv().await {
        write_log(&pool, &active_keys, &hll, row).await;
    }
}

async fn write_log(
    pool: &PgPool,
    active_keys: &ActiveKeysCache,
    hll: &HllEngine,
    row: RequestLog,
) {
    let indexed_metadata = match row.majordomo_api_key_id {
        Some(owner_id) => {
            let active = active_keys.get_active(owner_id).await;
            partition_indexed(&row.raw_metadata, &active)
        }
        None => HashMap::new(),
    };

    let insert = sqlx::query(
        r#"
        INSERT INTO llm_requests (
            id, majordomo_api_key_id, proxy_key_id, provider_api_key_hash, provider_api_key_alias,
            provider, model, request_path, request_method,
            requested_at, responded_at, response_time_ms,
            input_tokens, output_tokens, cached_tokens, cache_creation_tokens,
            input_cost, output_cost, total_cost,
            status_code, error_message, raw_metadata, indexed_metadata,
            request_body, response_body, body_s3_key, model_alias_found
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
            $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27
        )
        "#,
    )
    .bind(row.id)
    .bind(row.majordomo_api_key_id)
    .bind(row.proxy_key_id)
    .bind(&row.provider_api_key_hash)
    .bind(&row.provider_api_key_alias)
    .bind(row.provider.as_str())
    .bind(&row.model)
    .bind(&row.request_path)
    .bind(&row.request_method)
    .bind(row.requested_at)
    .bind(row.responded_at)
    .bind(row.response_time_ms)
    .bind(row.input_tokens)
    .bind(row.output_tokens)
    .bind(row.cached_tokens)
    .bind(row.cache_creation_tokens)
    .bind(row.input_cost)
    .bind(row.output_cost)
    .bind(row.total_cost)
    .bind(row.status_code)
    .bind(&row.error_message)
    .bind(sqlx::types::Json(&row.raw_metadata))
    .bind(sqlx::types::Json(&indexed_metadata))
    .bind(&row.request_body)
    .bind(&row.response_body)
    .bind(&row.body_s3_key)
    .bind(row.model_alias_found)
    .execute(pool)
    .await;

    if let Err(err) = insert {
        tracing::error!(request_id = %row.id, error = %err, "failed to write request log");
        return;
    }

    let Some(owner_id) = row.majordomo_api_key_id else {
        return;
    };
    for (name, value) in &row.raw_metadata {
        hll.add(owner_id, name, value);
    }
    register_metadata_keys(pool, owner_id, &row.raw_metadata).await;
}

/// The indexed column holds the subset of raw metadata whose names are
/// active for the owner.
fn partition_indexed(
    raw: &HashMap<String, String>,
    active: &std::collections::HashSet<String>,
) -> HashMap<String, String> {
    raw.iter()
        .filter(|(name, _)| active.contains(*name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Registers first-seen metadata names; conflicts are a no-op so repeat
/// sightings never reset descriptor state.
async fn register_metadata_keys(
    pool: &PgPool,
    owner_id: Uuid,
    metadata: &HashMap<String, String>,
) {
    for name in metadata.keys() {
        let result = sqlx::query(
            r#"
            INSERT INTO llm_requests_metadata_keys (majordomo_api_key_id, key_name)
            VALUES ($1, $2)
            ON CONFLICT (majordomo_api_key_id, key_name) DO NOTHING
            "#,
        )
        .bind(owner_id)
        .bind(name)
        .execute(pool)
        .await;
        if let Err(err) = result {
            tracing::warn!(key = %name, error = %err, "failed to register metadata key");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn indexed_metadata_is_the_active_subset() {
        let raw = raw(&[("user", "u-1"), ("team", "billing"), ("env", "prod")]);
        let active = HashSet::from(["user".to_string(), "env".to_string()]);

        let indexed = partition_indexed(&raw, &active);
        assert_eq!(indexed.len(), 2);
        assert_eq!(indexed["user"], "u-1");
        assert_eq!(indexed["env"], "prod");
        assert!(indexed.keys().all(|name| raw.contains_key(name)));
    }

    #[test]
    fn indexed_metadata_matches_raw_when_everything_is_active() {
        let raw = raw(&[("user", "u-1"), ("env", "prod")]);
        let active: HashSet<String> = raw.keys().cloned().collect();
        assert_eq!(partition_indexed(&raw, &active), raw);
    }

    #[test]
    fn indexed_metadata_is_empty_with_no_active_names() {
        let raw = raw(&[("user", "u-1")]);
        assert!(partition_indexed(&raw, &HashSet::new()).is_empty());
    }
}
