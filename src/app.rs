use crate::auth::AuthState;
use crate::config::RuntimeConfig;
use crate::error::{AppError, AppResult};
use crate::model_registry::MappingCache;
use axum::Router;
use axum::http::header::HeaderName;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub auth: AuthState,
    pub http: reqwest::Client,
    pub model_cache: MappingCache,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .build()
        .map_err(|err| AppError::internal("http_client_init_failed", err.to_string()))?;
    let metrics = init_metrics()?;
    let auth = AuthState::new(runtime.api_key.clone());
    tracing::info!(
        upstream = %runtime.upstream.base_url,
        auth_enabled = auth.enabled(),
        tool_support = runtime.features.tool_support,
        thinking_prompt = runtime.features.thinking_prompt,
        "state loaded"
    );
    Ok(AppState {
        auth,
        runtime: Arc::new(runtime),
        http,
        model_cache: MappingCache::new(),
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR
                    .set(AppError::internal("metrics_init_failed", err.to_string()));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| AppError::internal("metrics_init_failed", "metrics recorder not available"))
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route("/health", get(crate::handlers::health))
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
