use crate::config::{CredentialSource, EnvCredentials, RuntimeConfig};
use crate::error::{AppError, AppResult};
use crate::handlers;
use crate::providers::ProviderRegistry;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, StatusCode};
use axum::routing::{get, post};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub providers: Arc<ProviderRegistry>,
    pub credentials: Arc<dyn CredentialSource>,
    pub metrics: PrometheusHandle,
}

/// Process-wide Prometheus recorder; installing twice fails, so every state shares one.
static RECORDER: OnceLock<Result<PrometheusHandle, String>> = OnceLock::new();

pub async fn load_state() -> AppResult<AppState> {
    load_state_with(RuntimeConfig::from_env(), Arc::new(EnvCredentials)).await
}

pub async fn load_state_with(
    runtime: RuntimeConfig,
    credentials: Arc<dyn CredentialSource>,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("chatrelay/", env!("CARGO_PKG_VERSION")))
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(Duration::from_millis(runtime.connect_timeout_ms))
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let providers = ProviderRegistry::with_defaults(&runtime.backends).map_err(|err| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "provider_registry_init_failed",
            err.to_string(),
        )
    })?;

    let metrics = init_metrics()?;

    Ok(AppState {
        runtime: Arc::new(runtime),
        http,
        providers: Arc::new(providers),
        credentials,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    RECORDER
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .map_err(|err| err.to_string())
        })
        .clone()
        .map_err(|message| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics_init_failed",
                message,
            )
        })
}

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let max_body_bytes = state.runtime.max_body_bytes;
    let api = Router::new()
        .route("/api/chat", post(handlers::chat))
        .route("/api/models", get(handlers::list_models));
    api.route(&metrics_path, get(handlers::metrics))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(SetRequestIdLayer::new(REQUEST_ID, MakeRequestUuid))
        .layer(PropagateRequestIdLayer::new(REQUEST_ID))
        .layer(TraceLayer::new_for_http())
}
