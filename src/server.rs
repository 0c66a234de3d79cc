use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::api;
use crate::auth::{ProxyResolver, Resolver};
use crate::config::Config;
use crate::pricing::PricingService;
use crate::proxy;
use crate::proxy::upstream::UpstreamClient;
use crate::secrets::SecretBox;
use crate::storage::{S3BodyStore, Storage};
use crate::Result;

const READINESS_TIMEOUT: Duration = Duration::from_secs(3);

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    pub s3: Option<Arc<S3BodyStore>>,
    pub pricing: Arc<PricingService>,
    pub resolver: Arc<Resolver>,
    pub proxy_resolver: Arc<ProxyResolver>,
    pub secret_box: SecretBox,
    pub upstream: Arc<UpstreamClient>,
}

/// Identifier minted per inbound request and echoed as `x-request-id`.
#[derive(Clone, Copy, Debug)]
pub struct RequestId(pub Uuid);

/// Routes plus the middleware stack: request-id injection wraps panic
/// recovery, which wraps access logging; everything that is not a health or
/// management route proxies upstream.
pub fn router(state: AppState) -> Router {
    // One overall deadline per request; the inbound body read is bounded by
    // it together with everything else.
    let write_timeout = Duration::from_secs(state.config.server.write_timeout_secs.max(1));

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readyz))
        .nest("/api/v1", api::router(state.clone()))
        .fallback(proxy::handle)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(write_timeout));
    app = with_recovery(app);

    if let Some(cors) = cors_layer(&state.config.server.cors_origins) {
        app = app.layer(cors);
    }

    app.with_state(state)
}

/// Request-id injection wraps panic recovery: a `ServiceBuilder` stack runs
/// first-added-outermost, so the id is on the request before `recover` reads
/// it, and the 500 for a panicking handler carries the same `x-request-id`
/// every other response gets.
fn with_recovery<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(
        ServiceBuilder::new()
            .layer(axum::middleware::from_fn(inject_request_id))
            .layer(axum::middleware::from_fn(recover)),
    )
}

/// Binds, serves until SIGINT/SIGTERM, then shuts the background machinery
/// down in dependency order: log sink, HLL engine, S3 uploader, pool.
pub async fn serve(state: AppState) -> Result<()> {
    let config = Arc::clone(&state.config);
    let storage = Arc::clone(&state.storage);
    let s3 = state.s3.clone();
    let pricing = Arc::clone(&state.pricing);

    let app = router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down server");
    pricing.close();
    storage.shutdown().await;
    if let Some(s3) = &s3 {
        s3.close().await;
    }
    storage.close_pool().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => tracing::error!(error = %err, "failed to install sigterm handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Constant liveness answer; touches no dependencies.
async fn health() -> &'static str {
    "ok"
}

/// Readiness pings the store with a short timeout.
async fn readyz(State(state): State<AppState>) -> Response {
    match tokio::time::timeout(READINESS_TIMEOUT, state.storage.ping()).await {
        Ok(Ok(())) => (StatusCode::OK, Json(json!({"status": "ok"}))).into_response(),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "error", "error": err.to_string()})),
            )
                .into_response()
        }
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "error", "error": "readiness check timed out"})),
        )
            .into_response(),
    }
}

async fn inject_request_id(mut request: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(id);
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Converts a panicking handler into a logged 500 instead of a dropped
/// connection.
async fn recover(request: Request, next: Next) -> Response {
    let request_id = request.extensions().get::<RequestId>().copied();
    let result = futures_util::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(
        next.run(request),
    ))
    .await;

    match result {
        Ok(response) => response,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            match request_id {
                Some(id) => {
                    tracing::error!(request_id = %id.0, panic = %message, "handler panicked")
                }
                None => tracing::error!(panic = %message, "handler panicked"),
            }
            let mut response = Response::new(Body::from("internal server error"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            if let Some(id) = request_id {
                if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
                    response.headers_mut().insert("x-request-id", value);
                }
            }
            response
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let layer = if origins.iter().any(|origin| origin == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods(Any)
            .allow_headers(Any)
    };
    Some(layer)
}
