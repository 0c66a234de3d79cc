use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::providers::Provider;

/// An operator key record. The plaintext is shown once at creation and never
/// stored; only the hex SHA-256 digest persists.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct ApiKey {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub request_count: i64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CreateApiKeyInput {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpdateApiKeyInput {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Resolved operator key carried through request processing.
#[derive(Clone, Debug)]
pub struct ApiKeyInfo {
    pub id: Uuid,
    pub digest: String,
    pub name: String,
}

/// A tenant-minted proxy key that the gateway swaps for a stored upstream
/// credential before forwarding.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct ProxyKey {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub name: String,
    pub description: Option<String>,
    pub majordomo_api_key_id: Uuid,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub request_count: i64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CreateProxyKeyInput {
    pub name: String,
    pub description: Option<String>,
}

/// `(proxy_key, provider) → encrypted upstream credential`. The ciphertext is
/// opaque outside the secret box.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ProviderMapping {
    pub id: Uuid,
    pub proxy_key_id: Uuid,
    pub provider: String,
    pub encrypted_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Token counts extracted from an upstream response body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UsageMetrics {
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub cache_creation_tokens: i64,
}

/// Monetary cost computed from a usage metric and the pricing catalog.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Cost {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    /// False when the model was absent from both the catalog and the alias
    /// map, which zeroes every cost.
    pub model_alias_found: bool,
}

/// One row per completed upstream round trip. Weakly references the operator
/// and proxy keys so rows survive revocation.
#[derive(Clone, Debug)]
pub struct RequestLog {
    pub id: Uuid,
    pub majordomo_api_key_id: Option<Uuid>,
    pub proxy_key_id: Option<Uuid>,
    pub provider_api_key_hash: Option<String>,
    pub provider_api_key_alias: Option<String>,
    pub provider: Provider,
    pub model: String,
    pub request_path: String,
    pub request_method: String,
    pub requested_at: DateTime<Utc>,
    pub responded_at: DateTime<Utc>,
    pub response_time_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub cache_creation_tokens: i64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub status_code: i32,
    pub error_message: Option<String>,
    pub raw_metadata: HashMap<String, String>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub body_s3_key: Option<String>,
    pub model_alias_found: bool,
}
