//! Proxy-key and provider-mapping CRUD. Mappings hold secret-box
//! ciphertexts; plaintexts exist only inside the resolver.

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{CreateProxyKeyInput, ProviderMapping, ProxyKey};
use crate::Result;

const PROXY_KEY_COLUMNS: &str = "id, key_hash, name, description, majordomo_api_key_id, \
     is_active, created_at, revoked_at, last_used_at, request_count";

const MAPPING_COLUMNS: &str = "id, proxy_key_id, provider, encrypted_key, created_at, updated_at";

pub async fn create(
    pool: &PgPool,
    key_hash: &str,
    owner_id: Uuid,
    input: &CreateProxyKeyInput,
) -> Result<ProxyKey> {
    let key = sqlx::query_as::<_, ProxyKey>(&format!(
        "INSERT INTO proxy_keys (key_hash, name, description, majordomo_api_key_id)
         VALUES ($1, $2, $3, $4)
         RETURNING {PROXY_KEY_COLUMNS}"
    ))
    .bind(key_hash)
    .bind(&input.name)
    .bind(&input.description)
    .bind(owner_id)
    .fetch_one(pool)
    .await?;
    Ok(key)
}

pub async fn get_by_hash(pool: &PgPool, key_hash: &str) -> Result<Option<ProxyKey>> {
    let key = sqlx::query_as::<_, ProxyKey>(&format!(
        "SELECT {PROXY_KEY_COLUMNS} FROM proxy_keys WHERE key_hash = $1"
    ))
    .bind(key_hash)
    .fetch_optional(pool)
    .await?;
    Ok(key)
}

pub async fn get_by_id(pool: &PgPool, id: Uuid) -> Result<Option<ProxyKey>> {
    let key = sqlx::query_as::<_, ProxyKey>(&format!(
        "SELECT {PROXY_KEY_COLUMNS} FROM proxy_keys WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(key)
}

pub async fn list(pool: &PgPool, owner_id: Uuid) -> Result<Vec<ProxyKey>> {
    let keys = sqlx::query_as::<_, ProxyKey>(&format!(
        "SELECT {PROXY_KEY_COLUMNS} FROM proxy_keys
         WHERE majordomo_api_key_id = $1
         ORDER BY created_at DESC"
    ))
    .bind(owner_id)
    .fetch_all(pool)
    .await?;
    Ok(keys)
}

pub async fn revoke(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE proxy_keys
         SET is_active = false, revoked_at = NOW()
         WHERE id = $1 AND is_active = true",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn bump_usage(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE proxy_keys
         SET last_used_at = NOW(), request_count = request_count + 1
         WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Creates or replaces the `(proxy_key, provider)` mapping.
pub async fn set_provider_mapping(
    pool: &PgPool,
    proxy_key_id: Uuid,
    provider: &str,
    encrypted_key: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO proxy_key_provider_mappings (proxy_key_id, provider, encrypted_key)
         VALUES ($1, $2, $3)
         ON CONFLICT (proxy_key_id, provider) DO UPDATE
         SET encrypted_key = EXCLUDED.encrypted_key, updated_at = NOW()",
    )
    .bind(proxy_key_id)
    .bind(provider)
    .bind(encrypted_key)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_provider_mapping(
    pool: &PgPool,
    proxy_key_id: Uuid,
    provider: &str,
) -> Result<Option<ProviderMapping>> {
    let mapping = sqlx::query_as::<_, ProviderMapping>(&format!(
        "SELECT {MAPPING_COLUMNS} FROM proxy_key_provider_mappings
         WHERE proxy_key_id = $1 AND provider = $2"
    ))
    .bind(proxy_key_id)
    .bind(provider)
    .fetch_optional(pool)
    .await?;
    Ok(mapping)
}

pub async fn list_provider_mappings(
    pool: &PgPool,
    proxy_key_id: Uuid,
) -> Result<Vec<ProviderMapping>> {
    let mappings = sqlx::query_as::<_, ProviderMapping>(&format!(
        "SELECT {MAPPING_COLUMNS} FROM proxy_key_provider_mappings
         WHERE proxy_key_id = $1
         ORDER BY provider"
    ))
    .bind(proxy_key_id)
    .fetch_all(pool)
    .await?;
    Ok(mappings)
}

pub async fn delete_provider_mapping(
    pool: &PgPool,
    proxy_key_id: Uuid,
    provider: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "DELETE FROM proxy_key_provider_mappings
         WHERE proxy_key_id = $1 AND provider = $2",
    )
    .bind(proxy_key_id)
    .bind(provider)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
