//! End-to-end tests over the gateway router with a recording fake upstream.
//! The key stores are in-memory fakes; the request-log machinery runs against
//! a lazy pool and stays off the assertion path.

use std::collections::HashMap;
use std::io::Read as _;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

use majordomo::auth::{hash_key, ProxyResolver, Resolver};
use majordomo::config::Config;
use majordomo::models::{ApiKey, ProviderMapping, ProxyKey};
use majordomo::pricing::{ModelPricing, PricingService};
use majordomo::proxy::upstream::UpstreamClient;
use majordomo::secrets::SecretBox;
use majordomo::server::{router, AppState};
use majordomo::storage::{connect_lazy, ApiKeyStore, ProxyKeyStore, Storage};

const OPERATOR_KEY: &str = "mdm_sk_test_operator_key";
const PROXY_KEY: &str = "mdm_pk_test_proxy_key";

#[derive(Clone)]
struct RecordedRequest {
    method: String,
    path: String,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Clone)]
struct FakeUpstream {
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
    status: StatusCode,
    body: Bytes,
}

impl FakeUpstream {
    fn requests(&self) -> Vec<RecordedRequest> {
        self.recorded.lock().unwrap().clone()
    }
}

async fn record_and_respond(State(state): State<FakeUpstream>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, usize::MAX).await.unwrap_or_default();
    state.recorded.lock().unwrap().push(RecordedRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        headers: parts.headers,
        body,
    });

    let mut response = Response::new(Body::from(state.body.clone()));
    *response.status_mut() = state.status;
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/json"));
    response
}

/// Serves a recording upstream on a loopback port and returns its base URL.
async fn spawn_upstream(status: StatusCode, body: Value) -> (String, FakeUpstream) {
    let upstream = FakeUpstream {
        recorded: Arc::new(Mutex::new(Vec::new())),
        status,
        body: Bytes::from(body.to_string()),
    };
    let app = Router::new()
        .fallback(record_and_respond)
        .with_state(upstream.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let base_url = format!("http://{}", listener.local_addr().expect("addr"));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (base_url, upstream)
}

struct FakeKeys {
    api_keys: Vec<ApiKey>,
    proxy_keys: Vec<ProxyKey>,
    mappings: Mutex<HashMap<(Uuid, String), String>>,
}

#[async_trait]
impl ApiKeyStore for FakeKeys {
    async fn api_key_by_hash(&self, key_hash: &str) -> majordomo::Result<Option<ApiKey>> {
        Ok(self
            .api_keys
            .iter()
            .find(|key| key.key_hash == key_hash)
            .cloned())
    }

    async fn bump_api_key_usage(&self, _id: Uuid) -> majordomo::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ProxyKeyStore for FakeKeys {
    async fn proxy_key_by_hash(&self, key_hash: &str) -> majordomo::Result<Option<ProxyKey>> {
        Ok(self
            .proxy_keys
            .iter()
            .find(|key| key.key_hash == key_hash)
            .cloned())
    }

    async fn provider_mapping(
        &self,
        proxy_key_id: Uuid,
        provider: &str,
    ) -> majordomo::Result<Option<ProviderMapping>> {
        let mappings = self.mappings.lock().unwrap();
        Ok(mappings
            .get(&(proxy_key_id, provider.to_string()))
            .map(|ciphertext| ProviderMapping {
                id: Uuid::new_v4(),
                proxy_key_id,
                provider: provider.to_string(),
                encrypted_key: ciphertext.clone(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }))
    }

    async fn bump_proxy_key_usage(&self, _id: Uuid) -> majordomo::Result<()> {
        Ok(())
    }
}

struct TestGateway {
    state: AppState,
    operator_id: Uuid,
    proxy_key_id: Uuid,
}

fn secret_box() -> SecretBox {
    SecretBox::new(&"42".repeat(32)).expect("box")
}

/// A gateway whose provider base URLs all point at `base_url`, with one
/// active operator key, one proxy key owned by it, and an `openai` mapping
/// decrypting to `sk-REAL`.
fn test_gateway(base_url: &str, proxy_owner: Option<Uuid>) -> TestGateway {
    let operator_id = Uuid::new_v4();
    let proxy_key_id = Uuid::new_v4();
    let sbox = secret_box();

    let api_key = ApiKey {
        id: operator_id,
        key_hash: hash_key(OPERATOR_KEY),
        name: "test".to_string(),
        description: None,
        is_active: true,
        created_at: Utc::now(),
        revoked_at: None,
        last_used_at: None,
        request_count: 0,
    };
    let proxy_key = ProxyKey {
        id: proxy_key_id,
        key_hash: hash_key(PROXY_KEY),
        name: "prod".to_string(),
        description: None,
        majordomo_api_key_id: proxy_owner.unwrap_or(operator_id),
        is_active: true,
        created_at: Utc::now(),
        revoked_at: None,
        last_used_at: None,
        request_count: 0,
    };
    let keys = Arc::new(FakeKeys {
        api_keys: vec![api_key],
        proxy_keys: vec![proxy_key],
        mappings: Mutex::new(HashMap::from([(
            (proxy_key_id, "openai".to_string()),
            sbox.encrypt("sk-REAL").expect("encrypt"),
        )])),
    });

    let mut config = Config::default();
    config.providers.openai.base_url = base_url.to_string();
    config.providers.anthropic.base_url = base_url.to_string();
    config.providers.gemini.base_url = base_url.to_string();
    config.providers.anthropic_openai.base_url = base_url.to_string();

    let pool = connect_lazy(&config.storage.postgres).expect("pool");
    let storage = Arc::new(Storage::new(pool, &config.metadata));

    let pricing = Arc::new(PricingService::with_catalog(
        HashMap::from([(
            "gpt-4o-2024-08-06".to_string(),
            ModelPricing {
                input_per_million: 2.5,
                output_per_million: 10.0,
                cached_per_million: 1.25,
            },
        )]),
        HashMap::new(),
    ));

    let state = AppState {
        config: Arc::new(config),
        storage,
        s3: None,
        pricing,
        resolver: Arc::new(Resolver::new(keys.clone() as Arc<dyn ApiKeyStore>)),
        proxy_resolver: Arc::new(ProxyResolver::new(
            keys as Arc<dyn ProxyKeyStore>,
            sbox.clone(),
        )),
        secret_box: sbox,
        upstream: Arc::new(UpstreamClient::new()),
    };

    TestGateway {
        state,
        operator_id,
        proxy_key_id,
    }
}

fn openai_response_body() -> Value {
    json!({
        "id": "chatcmpl-1",
        "model": "gpt-4o-2024-08-06",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}}],
        "usage": {"prompt_tokens": 13, "completion_tokens": 9, "total_tokens": 22}
    })
}

#[tokio::test]
async fn forwards_valid_requests_and_returns_the_body_verbatim() {
    let (base_url, upstream) = spawn_upstream(StatusCode::OK, openai_response_body()).await;
    let gateway = test_gateway(&base_url, None);
    let app = router(gateway.state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("x-majordomo-key", OPERATOR_KEY)
        .header("authorization", "Bearer sk-upstream")
        .header("x-majordomo-user", "u-1")
        .header("accept-encoding", "identity;q=0.5, br")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"model": "gpt-4o-2024-08-06", "messages": []}).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-request-id").is_some());

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, openai_response_body());

    let seen = upstream.requests();
    assert_eq!(seen.len(), 1);
    let seen = &seen[0];
    assert_eq!(seen.method, "POST");
    assert_eq!(seen.path, "/v1/chat/completions");
    // The caller's own credential passes through untouched.
    assert_eq!(seen.headers.get("authorization").unwrap(), "Bearer sk-upstream");
    // Header hygiene: nothing gateway-internal leaks upstream. The
    // transport negotiates its own accept-encoding, so only the caller's
    // value must be gone, not the header itself.
    for name in seen.headers.keys() {
        assert!(
            !name.as_str().starts_with("x-majordomo-"),
            "leaked header {name}"
        );
    }
    let upstream_accept = seen
        .headers
        .get("accept-encoding")
        .map(|value| value.to_str().unwrap_or_default().to_string());
    assert_ne!(upstream_accept.as_deref(), Some("identity;q=0.5, br"));
}

#[tokio::test]
async fn swaps_proxy_keys_for_the_stored_upstream_credential() {
    let (base_url, upstream) = spawn_upstream(StatusCode::OK, openai_response_body()).await;
    let gateway = test_gateway(&base_url, None);
    let app = router(gateway.state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("x-majordomo-key", OPERATOR_KEY)
        .header("authorization", format!("Bearer {PROXY_KEY}"))
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"model": "gpt-4o-2024-08-06", "messages": []}).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let seen = upstream.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].headers.get("authorization").unwrap(), "Bearer sk-REAL");
}

#[tokio::test]
async fn rejects_proxy_keys_owned_by_someone_else_without_calling_upstream() {
    let (base_url, upstream) = spawn_upstream(StatusCode::OK, openai_response_body()).await;
    // The proxy key belongs to a different operator key.
    let gateway = test_gateway(&base_url, Some(Uuid::new_v4()));
    let app = router(gateway.state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("x-majordomo-key", OPERATOR_KEY)
        .header("authorization", format!("Bearer {PROXY_KEY}"))
        .body(Body::from("{}"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(upstream.requests().is_empty());
}

#[tokio::test]
async fn rejects_missing_and_unknown_operator_keys() {
    let (base_url, upstream) = spawn_upstream(StatusCode::OK, openai_response_body()).await;
    let gateway = test_gateway(&base_url, None);
    let app = router(gateway.state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sk-upstream")
        .body(Body::from("{}"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("x-majordomo-key", "mdm_sk_who_is_this")
        .header("authorization", "Bearer sk-upstream")
        .body(Body::from("{}"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert!(upstream.requests().is_empty());
}

#[tokio::test]
async fn upstream_error_statuses_are_forwarded_verbatim() {
    let error_body = json!({"error": {"message": "rate limited"}});
    let (base_url, _upstream) =
        spawn_upstream(StatusCode::TOO_MANY_REQUESTS, error_body.clone()).await;
    let gateway = test_gateway(&base_url, None);
    let app = router(gateway.state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("x-majordomo-key", OPERATOR_KEY)
        .header("authorization", "Bearer sk-upstream")
        .body(Body::from("{}"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, error_body);
}

#[tokio::test]
async fn unreachable_upstream_returns_bad_gateway() {
    // A loopback port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let gateway = test_gateway(&base_url, None);
    let app = router(gateway.state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("x-majordomo-key", OPERATOR_KEY)
        .header("authorization", "Bearer sk-upstream")
        .body(Body::from("{}"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn translates_openai_requests_for_the_anthropic_openai_provider() {
    let anthropic_body = json!({
        "id": "msg_01",
        "model": "claude-sonnet-4-20250514",
        "content": [{"type": "text", "text": "Hello!"}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 10, "output_tokens": 5}
    });
    let (base_url, upstream) = spawn_upstream(StatusCode::OK, anthropic_body).await;
    let gateway = test_gateway(&base_url, None);
    let app = router(gateway.state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("x-majordomo-key", OPERATOR_KEY)
        .header("x-majordomo-provider", "anthropic-openai")
        .header("authorization", "Bearer sk-ant-caller")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "claude-sonnet-4-20250514",
                "messages": [
                    {"role": "system", "content": "Be brief."},
                    {"role": "user", "content": "Hi"}
                ]
            })
            .to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Upstream saw the Anthropic wire format at the rewritten path.
    let seen = upstream.requests();
    assert_eq!(seen.len(), 1);
    let seen = &seen[0];
    assert_eq!(seen.path, "/v1/messages");
    assert!(seen.headers.get("authorization").is_none());
    assert_eq!(seen.headers.get("x-api-key").unwrap(), "sk-ant-caller");
    assert_eq!(seen.headers.get("anthropic-version").unwrap(), "2023-06-01");

    let sent: Value = serde_json::from_slice(&seen.body).unwrap();
    assert_eq!(sent["system"], "Be brief.");
    assert_eq!(sent["max_tokens"], 4096);
    assert_eq!(sent["messages"], json!([{"role": "user", "content": "Hi"}]));

    // The caller got an OpenAI chat completion back.
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello!");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 10);
    assert_eq!(body["usage"]["completion_tokens"], 5);
    assert_eq!(body["usage"]["total_tokens"], 15);
}

#[tokio::test]
async fn compresses_large_json_responses_when_the_caller_accepts_gzip() {
    let padding = "x".repeat(4096);
    let big_body = json!({"model": "gpt-4o-2024-08-06", "padding": padding});
    let (base_url, _upstream) = spawn_upstream(StatusCode::OK, big_body.clone()).await;
    let gateway = test_gateway(&base_url, None);
    let app = router(gateway.state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("x-majordomo-key", OPERATOR_KEY)
        .header("authorization", "Bearer sk-upstream")
        .header("accept-encoding", "gzip")
        .body(Body::from("{}"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-encoding").unwrap(), "gzip");
    assert_eq!(response.headers().get("vary").unwrap(), "Accept-Encoding");

    let compressed = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let mut decoder = flate2::read::GzDecoder::new(compressed.as_ref());
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).expect("gunzip");
    let body: Value = serde_json::from_slice(&decompressed).unwrap();
    assert_eq!(body, big_body);
}

#[tokio::test]
async fn small_responses_are_not_compressed() {
    let (base_url, _upstream) = spawn_upstream(StatusCode::OK, json!({"ok": true})).await;
    let gateway = test_gateway(&base_url, None);
    let app = router(gateway.state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("x-majordomo-key", OPERATOR_KEY)
        .header("authorization", "Bearer sk-upstream")
        .header("accept-encoding", "gzip")
        .body(Body::from("{}"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("content-encoding").is_none());
}

#[tokio::test]
async fn health_answers_without_dependencies() {
    let (base_url, _upstream) = spawn_upstream(StatusCode::OK, json!({})).await;
    let gateway = test_gateway(&base_url, None);
    let app = router(gateway.state.clone());

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn readiness_reports_store_failures() {
    let (base_url, _upstream) = spawn_upstream(StatusCode::OK, json!({})).await;
    let gateway = test_gateway(&base_url, None);
    let app = router(gateway.state.clone());

    // The lazy pool has no Postgres behind it.
    let request = Request::builder()
        .method("GET")
        .uri("/readyz")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn management_routes_require_an_operator_key() {
    let (base_url, _upstream) = spawn_upstream(StatusCode::OK, json!({})).await;
    let gateway = test_gateway(&base_url, None);
    let app = router(gateway.state.clone());

    let request = Request::builder()
        .method("GET")
        .uri("/api/v1/proxy-keys")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let _ = (gateway.operator_id, gateway.proxy_key_id);
}
