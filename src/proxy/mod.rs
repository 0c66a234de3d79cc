pub mod compression;
pub mod upstream;

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::{hash_key, ProxyResolution};
use crate::config::{BodyStorage, Config};
use crate::models::{ApiKeyInfo, RequestLog, UsageMetrics};
use crate::providers::{self, translator, Provider, PROVIDER_HEADER};
use crate::server::{AppState, RequestId};
use crate::storage::{BodyUpload, S3BodyStore};

const OPERATOR_KEY_HEADER: &str = "x-majordomo-key";
const PROVIDER_ALIAS_HEADER: &str = "x-majordomo-provider-alias";
const METADATA_HEADER_PREFIX: &str = "x-majordomo-";

/// Error bodies keep only this much of the upstream response.
const ERROR_MESSAGE_LIMIT: usize = 500;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The proxy request lifecycle: authenticate, resolve credentials, forward,
/// respond, then account for the round trip off the hot path.
pub async fn handle(State(state): State<AppState>, request: Request) -> Response {
    let requested_at = Utc::now();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0)
        .unwrap_or_else(Uuid::new_v4);

    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    // Operator key first; without an owner there is nothing to attribute, so
    // failures return before any log row exists.
    let operator_key = header_str(&parts.headers, OPERATOR_KEY_HEADER).unwrap_or_default();
    let key_info = match state.resolver.resolve(&operator_key).await {
        Ok(info) => info,
        Err(err) => {
            tracing::debug!(request_id = %request_id, error = %err, "API key validation failed");
            return plain_error(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    };

    // Hash the caller's upstream credential verbatim for per-key usage
    // rollups; never store the value itself.
    let provider_key_hash = header_str(&parts.headers, "authorization").map(|s| hash_key(&s));
    let provider_key_alias = header_str(&parts.headers, PROVIDER_ALIAS_HEADER);

    let read_timeout = Duration::from_secs(state.config.server.read_timeout_secs.max(1));
    let body = match tokio::time::timeout(read_timeout, axum::body::to_bytes(body, usize::MAX)).await
    {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            tracing::debug!(request_id = %request_id, error = %err, "failed to read request body");
            return plain_error(StatusCode::BAD_REQUEST, "failed to read request body");
        }
        Err(_) => {
            tracing::debug!(request_id = %request_id, "timed out reading request body");
            return plain_error(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let custom_headers = collect_custom_headers(&parts.headers);
    let provider = providers::detect(&path, &custom_headers);
    let base_url = base_url(&state.config, provider);

    let mut upstream_headers = parts.headers.clone();
    let mut proxy_key_id = None;

    let presented = bearer_token(&parts.headers);
    match state
        .proxy_resolver
        .resolve(&presented, provider, key_info.id)
        .await
    {
        Ok(ProxyResolution::Passthrough) => {}
        Ok(ProxyResolution::Substituted {
            credential,
            proxy_key_id: id,
        }) => {
            apply_upstream_credential(&mut upstream_headers, provider, &credential);
            proxy_key_id = Some(id);
        }
        Err(err) => {
            tracing::debug!(request_id = %request_id, error = %err, "proxy key resolution failed");
            return plain_error(StatusCode::UNAUTHORIZED, &format!("unauthorized: {err}"));
        }
    }

    // Translation is confined to the anthropic-openai branch; every other
    // provider forwards the body untouched.
    let mut upstream_path = path.clone();
    let mut upstream_body = body.clone();
    if provider.requires_translation() {
        match translator::openai_request_to_anthropic(&body) {
            Ok((translated, new_path)) => {
                upstream_body = Bytes::from(translated);
                upstream_path = new_path.to_string();
            }
            Err(err) => {
                tracing::warn!(request_id = %request_id, error = %err,
                    "request translation failed, forwarding as-is");
            }
        }
        rewrite_bearer_to_api_key(&mut upstream_headers);
    }

    let path_and_query = match &query {
        Some(query) => format!("{upstream_path}?{query}"),
        None => upstream_path.clone(),
    };

    let upstream = match state
        .upstream
        .forward(&base_url, method.clone(), &path_and_query, &upstream_headers, upstream_body)
        .await
    {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::error!(request_id = %request_id, error = %err, "upstream request failed");
            let responded_at = Utc::now();
            spawn_log_task(LogTask {
                state: state.clone(),
                request_id,
                key_info,
                proxy_key_id,
                provider_key_hash,
                provider_key_alias,
                provider,
                method,
                path,
                requested_at,
                responded_at,
                response_time_ms: (responded_at - requested_at).num_milliseconds(),
                status: StatusCode::BAD_GATEWAY,
                request_body: body,
                response_body: Bytes::from(err.to_string()),
                response_headers: HeaderMap::new(),
                custom_headers,
            });
            return plain_error(StatusCode::BAD_GATEWAY, "upstream request failed");
        }
    };

    let mut response_body = upstream.body.clone();
    if provider.requires_translation() && upstream.status.as_u16() < 400 {
        match translator::anthropic_response_to_openai(&response_body) {
            Ok(translated) => response_body = Bytes::from(translated),
            Err(err) => {
                tracing::warn!(request_id = %request_id, error = %err,
                    "response translation failed, returning as-is");
            }
        }
    }

    let responded_at = Utc::now();

    let mut response_headers = upstream::response_headers(&upstream.headers);

    // Optionally recompress for the caller; upstream compression was
    // stripped by the transport.
    let accept_encoding = header_str(&parts.headers, "accept-encoding").unwrap_or_default();
    let content_type = header_str(&response_headers, "content-type").unwrap_or_default();
    let mut client_body = response_body.clone();
    if compression::should_compress(&accept_encoding, &content_type, client_body.len()) {
        match compression::gzip_compress(&client_body) {
            Ok(compressed) => {
                client_body = Bytes::from(compressed);
                response_headers.insert("content-encoding", HeaderValue::from_static("gzip"));
                response_headers.insert("vary", HeaderValue::from_static("Accept-Encoding"));
            }
            Err(err) => {
                tracing::warn!(request_id = %request_id, error = %err,
                    "failed to compress response, sending uncompressed");
            }
        }
    }

    spawn_log_task(LogTask {
        state,
        request_id,
        key_info,
        proxy_key_id,
        provider_key_hash,
        provider_key_alias,
        provider,
        method,
        path,
        requested_at,
        responded_at,
        response_time_ms: upstream.response_time.as_millis() as i64,
        status: upstream.status,
        request_body: body,
        response_body,
        response_headers: upstream.headers,
        custom_headers,
    });

    let mut response = Response::new(Body::from(client_body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = response_headers;
    response
}

struct LogTask {
    state: AppState,
    request_id: Uuid,
    key_info: ApiKeyInfo,
    proxy_key_id: Option<Uuid>,
    provider_key_hash: Option<String>,
    provider_key_alias: Option<String>,
    provider: Provider,
    method: Method,
    path: String,
    requested_at: DateTime<Utc>,
    responded_at: DateTime<Utc>,
    response_time_ms: i64,
    status: StatusCode,
    request_body: Bytes,
    response_body: Bytes,
    response_headers: HeaderMap,
    custom_headers: HashMap<String, String>,
}

/// The log row is assembled on a detached task so analytics never delay the
/// caller-visible response.
fn spawn_log_task(task: LogTask) {
    tokio::spawn(async move {
        assemble_and_log(task).await;
    });
}

async fn assemble_and_log(task: LogTask) {
    let mut metrics = match providers::parse_response(task.provider, &task.response_body) {
        Ok(metrics) => metrics,
        Err(err) => {
            tracing::warn!(request_id = %task.request_id, error = %err, "failed to parse response");
            UsageMetrics {
                model: providers::extract_model(&task.request_body),
                ..UsageMetrics::default()
            }
        }
    };
    if metrics.model.is_empty() {
        metrics.model = providers::extract_model(&task.request_body);
    }

    let cost = task.state.pricing.calculate(&metrics);

    let error_message = if task.status.as_u16() >= 400 {
        Some(truncate_lossy(&task.response_body, ERROR_MESSAGE_LIMIT))
    } else {
        None
    };

    let mut row = RequestLog {
        id: task.request_id,
        majordomo_api_key_id: Some(task.key_info.id),
        proxy_key_id: task.proxy_key_id,
        provider_api_key_hash: task.provider_key_hash,
        provider_api_key_alias: task.provider_key_alias,
        provider: task.provider,
        model: metrics.model,
        request_path: task.path.clone(),
        request_method: task.method.to_string(),
        requested_at: task.requested_at,
        responded_at: task.responded_at,
        response_time_ms: task.response_time_ms,
        input_tokens: metrics.input_tokens,
        output_tokens: metrics.output_tokens,
        cached_tokens: metrics.cached_tokens,
        cache_creation_tokens: metrics.cache_creation_tokens,
        input_cost: cost.input_cost,
        output_cost: cost.output_cost,
        total_cost: cost.total_cost,
        status_code: i32::from(task.status.as_u16()),
        error_message,
        raw_metadata: extract_custom_metadata(&task.custom_headers),
        request_body: None,
        response_body: None,
        body_s3_key: None,
        model_alias_found: cost.model_alias_found,
    };

    match task.state.config.logging.body_storage {
        BodyStorage::S3 => {
            if let Some(s3) = &task.state.s3 {
                let key = S3BodyStore::generate_key(
                    task.key_info.id,
                    task.request_id,
                    task.requested_at,
                );
                row.body_s3_key = Some(key.clone());
                s3.submit(BodyUpload {
                    key,
                    request_id: task.request_id,
                    timestamp: task.requested_at,
                    request_method: task.method.to_string(),
                    request_path: task.path,
                    request_headers: task.custom_headers,
                    request_body: task.request_body,
                    response_status: task.status.as_u16(),
                    response_headers: first_values(&task.response_headers),
                    response_body: task.response_body,
                });
            }
        }
        BodyStorage::Postgres => {
            let max = task.state.config.logging.max_body_size;
            if task.state.config.logging.store_request_body {
                row.request_body = Some(truncate_lossy(&task.request_body, max));
            }
            if task.state.config.logging.store_response_body {
                row.response_body = Some(truncate_lossy(&task.response_body, max));
            }
        }
        BodyStorage::None => {}
    }

    task.state.storage.write_request_log(row);
}

fn base_url(config: &Config, provider: Provider) -> String {
    let configured = match provider {
        Provider::OpenAi => &config.providers.openai.base_url,
        Provider::Anthropic => &config.providers.anthropic.base_url,
        Provider::Gemini => &config.providers.gemini.base_url,
        Provider::GeminiOpenAi => &config.providers.gemini_openai.base_url,
        Provider::AnthropicOpenAi => &config.providers.anthropic_openai.base_url,
        Provider::Azure => &config.providers.azure.base_url,
        Provider::Bedrock => &config.providers.bedrock.base_url,
        Provider::Unknown => return Provider::Unknown.default_base_url().to_string(),
    };
    if configured.is_empty() {
        provider.default_base_url().to_string()
    } else {
        configured.clone()
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// The upstream auth token with any `Bearer` scheme stripped, so proxy-key
/// detection sees the bare `mdm_pk_` prefix.
fn bearer_token(headers: &HeaderMap) -> String {
    let value = header_str(headers, "authorization").unwrap_or_default();
    value
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .unwrap_or(value)
}

/// Every `x-majordomo-*` header, lower-cased, first value.
fn collect_custom_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut collected = HashMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if !lower.starts_with(METADATA_HEADER_PREFIX) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            collected.entry(lower).or_insert_with(|| value.to_string());
        }
    }
    collected
}

/// Reserved headers drop out; the rest are stored with the prefix stripped.
fn extract_custom_metadata(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| {
            name.as_str() != OPERATOR_KEY_HEADER
                && name.as_str() != PROVIDER_HEADER
                && name.as_str() != PROVIDER_ALIAS_HEADER
        })
        .map(|(name, value)| {
            let stripped = name
                .strip_prefix(METADATA_HEADER_PREFIX)
                .unwrap_or(name)
                .to_string();
            (stripped, value.clone())
        })
        .collect()
}

fn apply_upstream_credential(headers: &mut HeaderMap, provider: Provider, credential: &str) {
    match provider {
        Provider::Anthropic => {
            headers.remove("authorization");
            if let Ok(value) = HeaderValue::from_str(credential) {
                headers.insert("x-api-key", value);
            }
            if !headers.contains_key("anthropic-version") {
                headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
            }
        }
        Provider::Gemini => {
            headers.remove("authorization");
            if let Ok(value) = HeaderValue::from_str(credential) {
                headers.insert("x-goog-api-key", value);
            }
        }
        _ => {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {credential}")) {
                headers.insert("authorization", value);
            }
        }
    }
}

/// `Authorization: Bearer X` becomes `X-Api-Key: X` for the Anthropic wire
/// format, with the protocol version pinned.
fn rewrite_bearer_to_api_key(headers: &mut HeaderMap) {
    if let Some(value) = header_str(headers, "authorization") {
        let token = value.strip_prefix("Bearer ").unwrap_or(&value);
        if let Ok(token) = HeaderValue::from_str(token) {
            headers.insert("x-api-key", token);
        }
        headers.remove("authorization");
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
    }
}

fn first_values(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    map
}

fn truncate_lossy(bytes: &Bytes, limit: usize) -> String {
    let end = limit.min(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        "content-type",
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn collects_only_majordomo_headers() {
        let headers = header_map(&[
            ("X-Majordomo-Key", "mdm_sk_x"),
            ("X-Majordomo-User", "u-1"),
            ("Authorization", "Bearer sk"),
            ("Content-Type", "application/json"),
        ]);
        let collected = collect_custom_headers(&headers);
        assert_eq!(collected.len(), 2);
        assert_eq!(collected["x-majordomo-key"], "mdm_sk_x");
        assert_eq!(collected["x-majordomo-user"], "u-1");
    }

    #[test]
    fn metadata_strips_prefix_and_reserved_names() {
        let headers = HashMap::from([
            ("x-majordomo-key".to_string(), "mdm_sk_x".to_string()),
            ("x-majordomo-provider".to_string(), "openai".to_string()),
            ("x-majordomo-provider-alias".to_string(), "prod".to_string()),
            ("x-majordomo-user".to_string(), "u-1".to_string()),
            ("x-majordomo-trace-id".to_string(), "t-9".to_string()),
        ]);
        let metadata = extract_custom_metadata(&headers);
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata["user"], "u-1");
        assert_eq!(metadata["trace-id"], "t-9");
    }

    #[test]
    fn bearer_scheme_is_stripped_for_proxy_detection() {
        let headers = header_map(&[("authorization", "Bearer mdm_pk_abc")]);
        assert_eq!(bearer_token(&headers), "mdm_pk_abc");

        let headers = header_map(&[("authorization", "mdm_pk_abc")]);
        assert_eq!(bearer_token(&headers), "mdm_pk_abc");

        assert_eq!(bearer_token(&HeaderMap::new()), "");
    }

    #[test]
    fn credential_rewrites_per_provider() {
        let mut headers = header_map(&[("authorization", "Bearer mdm_pk_abc")]);
        apply_upstream_credential(&mut headers, Provider::OpenAi, "sk-REAL");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-REAL");

        let mut headers = header_map(&[("authorization", "Bearer mdm_pk_abc")]);
        apply_upstream_credential(&mut headers, Provider::Anthropic, "ant-REAL");
        assert!(headers.get("authorization").is_none());
        assert_eq!(headers.get("x-api-key").unwrap(), "ant-REAL");
        assert_eq!(headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);

        let mut headers = header_map(&[("authorization", "Bearer mdm_pk_abc")]);
        apply_upstream_credential(&mut headers, Provider::Gemini, "goog-REAL");
        assert!(headers.get("authorization").is_none());
        assert_eq!(headers.get("x-goog-api-key").unwrap(), "goog-REAL");
    }

    #[test]
    fn translation_auth_rewrite_moves_bearer_to_api_key() {
        let mut headers = header_map(&[("authorization", "Bearer sk-caller")]);
        rewrite_bearer_to_api_key(&mut headers);
        assert!(headers.get("authorization").is_none());
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-caller");
        assert_eq!(headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);

        let mut empty = HeaderMap::new();
        rewrite_bearer_to_api_key(&mut empty);
        assert!(empty.get("x-api-key").is_none());
    }

    #[test]
    fn error_messages_truncate_at_500_bytes() {
        let body = Bytes::from(vec![b'e'; 600]);
        assert_eq!(truncate_lossy(&body, ERROR_MESSAGE_LIMIT).len(), 500);
        let short = Bytes::from_static(b"oops");
        assert_eq!(truncate_lossy(&short, ERROR_MESSAGE_LIMIT), "oops");
    }

    #[test]
    fn base_url_prefers_config_overrides() {
        let mut config = Config::default();
        assert_eq!(base_url(&config, Provider::OpenAi), "https://api.openai.com");
        config.providers.openai.base_url = "http://127.0.0.1:9999".to_string();
        assert_eq!(base_url(&config, Provider::OpenAi), "http://127.0.0.1:9999");
        assert_eq!(
            base_url(&config, Provider::AnthropicOpenAi),
            "https://api.anthropic.com"
        );
    }
}
