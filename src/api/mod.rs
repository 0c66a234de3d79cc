//! Proxy-key management REST surface under `/api/v1`, authenticated with the
//! caller's operator key through the same resolver the proxy path uses.
//! Upstream credentials go in encrypted and never come back out.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::generate_proxy_key;
use crate::models::{ApiKeyInfo, CreateProxyKeyInput, ProxyKey};
use crate::providers::Provider;
use crate::server::AppState;
use crate::storage::proxy_keys;
use crate::MajordomoError;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/proxy-keys", post(create_proxy_key).get(list_proxy_keys))
        .route("/proxy-keys/{id}", get(get_proxy_key).delete(revoke_proxy_key))
        .route("/proxy-keys/{id}/providers", get(list_provider_mappings))
        .route(
            "/proxy-keys/{id}/providers/{provider}",
            put(set_provider_mapping).delete(remove_provider_mapping),
        )
        .layer(axum::middleware::from_fn_with_state(state, require_operator_key))
}

/// Rejects requests whose `X-Majordomo-Key` does not resolve; the resolved
/// key rides along in request extensions.
async fn require_operator_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get("x-majordomo-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    match state.resolver.resolve(&presented).await {
        Ok(info) => {
            request.extensions_mut().insert(info);
            next.run(request).await
        }
        Err(err) => {
            tracing::debug!(error = %err, "management auth failed");
            json_error(StatusCode::UNAUTHORIZED, "unauthorized")
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateProxyKeyRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Serialize)]
struct CreatedProxyKey {
    /// Plaintext, shown exactly once.
    key: String,
    proxy_key: ProxyKey,
}

#[derive(Debug, Deserialize)]
struct SetProviderRequest {
    api_key: String,
}

/// Mapping view without the ciphertext.
#[derive(Serialize)]
struct ProviderMappingView {
    provider: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

async fn create_proxy_key(
    State(state): State<AppState>,
    axum::Extension(owner): axum::Extension<ApiKeyInfo>,
    Json(request): Json<CreateProxyKeyRequest>,
) -> Response {
    if request.name.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "name is required");
    }

    let (plaintext, digest) = generate_proxy_key();
    let input = CreateProxyKeyInput {
        name: request.name,
        description: request.description,
    };
    match proxy_keys::create(state.storage.pool(), &digest, owner.id, &input).await {
        Ok(proxy_key) => (
            StatusCode::CREATED,
            Json(CreatedProxyKey {
                key: plaintext,
                proxy_key,
            }),
        )
            .into_response(),
        Err(err) => internal_error(err),
    }
}

async fn list_proxy_keys(
    State(state): State<AppState>,
    axum::Extension(owner): axum::Extension<ApiKeyInfo>,
) -> Response {
    match proxy_keys::list(state.storage.pool(), owner.id).await {
        Ok(keys) => Json(keys).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn get_proxy_key(
    State(state): State<AppState>,
    axum::Extension(owner): axum::Extension<ApiKeyInfo>,
    Path(id): Path<Uuid>,
) -> Response {
    match owned_proxy_key(&state, &owner, id).await {
        Ok(key) => Json(key).into_response(),
        Err(response) => response,
    }
}

async fn revoke_proxy_key(
    State(state): State<AppState>,
    axum::Extension(owner): axum::Extension<ApiKeyInfo>,
    Path(id): Path<Uuid>,
) -> Response {
    let key = match owned_proxy_key(&state, &owner, id).await {
        Ok(key) => key,
        Err(response) => return response,
    };

    match proxy_keys::revoke(state.storage.pool(), id).await {
        Ok(true) => {
            state.proxy_resolver.invalidate(&key.key_hash);
            (StatusCode::OK, Json(json!({"status": "revoked"}))).into_response()
        }
        Ok(false) => json_error(StatusCode::CONFLICT, "proxy key already revoked"),
        Err(err) => internal_error(err),
    }
}

async fn set_provider_mapping(
    State(state): State<AppState>,
    axum::Extension(owner): axum::Extension<ApiKeyInfo>,
    Path((id, provider)): Path<(Uuid, String)>,
    Json(request): Json<SetProviderRequest>,
) -> Response {
    let key = match owned_proxy_key(&state, &owner, id).await {
        Ok(key) => key,
        Err(response) => return response,
    };
    if Provider::from_label(&provider) == Provider::Unknown {
        return json_error(StatusCode::BAD_REQUEST, "unknown provider");
    }
    if request.api_key.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "api_key is required");
    }

    let encrypted = match state.secret_box.encrypt(&request.api_key) {
        Ok(encrypted) => encrypted,
        Err(err) => {
            tracing::error!(proxy_key_id = %id, error = %err, "failed to encrypt provider key");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "encryption failed");
        }
    };

    let provider_tag = Provider::from_label(&provider).as_str();
    match proxy_keys::set_provider_mapping(state.storage.pool(), id, provider_tag, &encrypted).await
    {
        Ok(()) => {
            state.proxy_resolver.invalidate(&key.key_hash);
            (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
        }
        Err(err) => internal_error(err),
    }
}

async fn remove_provider_mapping(
    State(state): State<AppState>,
    axum::Extension(owner): axum::Extension<ApiKeyInfo>,
    Path((id, provider)): Path<(Uuid, String)>,
) -> Response {
    let key = match owned_proxy_key(&state, &owner, id).await {
        Ok(key) => key,
        Err(response) => return response,
    };

    let provider_tag = Provider::from_label(&provider).as_str();
    match proxy_keys::delete_provider_mapping(state.storage.pool(), id, provider_tag).await {
        Ok(true) => {
            state.proxy_resolver.invalidate(&key.key_hash);
            (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
        }
        Ok(false) => json_error(StatusCode::NOT_FOUND, "provider mapping not found"),
        Err(err) => internal_error(err),
    }
}

async fn list_provider_mappings(
    State(state): State<AppState>,
    axum::Extension(owner): axum::Extension<ApiKeyInfo>,
    Path(id): Path<Uuid>,
) -> Response {
    if let Err(response) = owned_proxy_key(&state, &owner, id).await {
        return response;
    }

    match proxy_keys::list_provider_mappings(state.storage.pool(), id).await {
        Ok(mappings) => {
            let views: Vec<ProviderMappingView> = mappings
                .into_iter()
                .map(|mapping| ProviderMappingView {
                    provider: mapping.provider,
                    created_at: mapping.created_at,
                    updated_at: mapping.updated_at,
                })
                .collect();
            Json(views).into_response()
        }
        Err(err) => internal_error(err),
    }
}

/// Fetches the key and enforces ownership; callers only ever see their own
/// proxy keys, missing and foreign ids are indistinguishable.
async fn owned_proxy_key(
    state: &AppState,
    owner: &ApiKeyInfo,
    id: Uuid,
) -> std::result::Result<ProxyKey, Response> {
    match proxy_keys::get_by_id(state.storage.pool(), id).await {
        Ok(Some(key)) if key.majordomo_api_key_id == owner.id => Ok(key),
        Ok(_) => Err(json_error(StatusCode::NOT_FOUND, "proxy key not found")),
        Err(err) => Err(internal_error(err)),
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

fn internal_error(err: MajordomoError) -> Response {
    tracing::error!(error = %err, "management request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}
