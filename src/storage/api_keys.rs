//! Operator-key CRUD. Plaintext keys never reach this layer; callers hash
//! first and only digests are stored.

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ApiKey, CreateApiKeyInput, UpdateApiKeyInput};
use crate::Result;

const API_KEY_COLUMNS: &str =
    "id, key_hash, name, description, is_active, created_at, revoked_at, last_used_at, request_count";

pub async fn create(pool: &PgPool, key_hash: &str, input: &CreateApiKeyInput) -> Result<ApiKey> {
    let key = sqlx::query_as::<_, ApiKey>(&format!(
        "INSERT INTO api_keys (key_hash, name, description)
         VALUES ($1, $2, $3)
         RETURNING {API_KEY_COLUMNS}"
    ))
    .bind(key_hash)
    .bind(&input.name)
    .bind(&input.description)
    .fetch_one(pool)
    .await?;
    Ok(key)
}

pub async fn get_by_hash(pool: &PgPool, key_hash: &str) -> Result<Option<ApiKey>> {
    let key = sqlx::query_as::<_, ApiKey>(&format!(
        "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key_hash = $1"
    ))
    .bind(key_hash)
    .fetch_optional(pool)
    .await?;
    Ok(key)
}

pub async fn get_by_id(pool: &PgPool, id: Uuid) -> Result<Option<ApiKey>> {
    let key = sqlx::query_as::<_, ApiKey>(&format!(
        "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(key)
}

pub async fn list(pool: &PgPool) -> Result<Vec<ApiKey>> {
    let keys = sqlx::query_as::<_, ApiKey>(&format!(
        "SELECT {API_KEY_COLUMNS} FROM api_keys ORDER BY created_at DESC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(keys)
}

pub async fn update(pool: &PgPool, id: Uuid, input: &UpdateApiKeyInput) -> Result<Option<ApiKey>> {
    let key = sqlx::query_as::<_, ApiKey>(&format!(
        "UPDATE api_keys
         SET name = COALESCE($1, name), description = COALESCE($2, description)
         WHERE id = $3
         RETURNING {API_KEY_COLUMNS}"
    ))
    .bind(&input.name)
    .bind(&input.description)
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(key)
}

/// Marks a key revoked. Returns false when the key was missing or already
/// revoked.
pub async fn revoke(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE api_keys
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
        "UPDATE api_keys
         SET last_used_at = NOW(), request_count = request_count + 1
         WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}
