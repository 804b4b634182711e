use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::openai::{ChatCompletionRequest, ModelCard, ModelList};
use crate::preprocess::{self, PreprocessOptions};
use crate::translate::{self, AggregateOptions};
use crate::upstream::{self, SamplingParams, UpstreamCallError, UpstreamErrorKind};
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    state.auth.authenticate(&headers)?;
    state
        .model_cache
        .refresh_from_upstream(&state.http, &state.runtime.upstream)
        .await;

    let created = chrono::Utc::now().timestamp();
    let data = state
        .model_cache
        .list_all()
        .await
        .into_iter()
        .map(|model| ModelCard {
            id: model.id,
            object: "model".to_string(),
            created,
            owned_by: model.owned_by,
            name: Some(model.display_name),
            description: model.description,
        })
        .collect();

    Ok(Json(ModelList {
        object: "list".to_string(),
        data,
    })
    .into_response())
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    state.auth.authenticate(&headers)?;
    let req: ChatCompletionRequest = serde_json::from_slice(&body).map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "invalid_request", err.to_string())
    })?;

    let Some(target) = state.model_cache.resolve(&req.model).await else {
        tracing::info!(model = %req.model, "rejecting unknown model");
        return Err(AppError::unsupported_model(&req.model));
    };

    let features = &state.runtime.features;
    let tools_active =
        preprocess::tools_active(req.tools(), req.tool_choice.as_ref(), features.tool_support);
    let messages = preprocess::preprocess(
        &req.messages,
        req.tools(),
        req.tool_choice.as_ref(),
        PreprocessOptions {
            tool_support: features.tool_support,
            thinking_prompt: features.thinking_prompt,
        },
    );
    let upstream_req = upstream::build_upstream_request(
        &target,
        messages,
        SamplingParams {
            temperature: req.temperature,
            top_p: req.top_p,
            max_tokens: req.max_tokens,
        },
        &state.runtime.upstream,
        chrono::Local::now(),
    );

    let mode = if req.wants_stream() { "stream" } else { "aggregate" };
    metrics::counter!("zlink_chat_requests_total", "mode" => mode).increment(1);
    tracing::debug!(
        model = %req.model,
        upstream_model = %target.upstream_model_id,
        tools_active,
        mode,
        "forwarding chat completion"
    );

    let token = upstream::acquire_token(&state.http, &state.runtime.upstream).await;
    let upstream_resp = upstream::call_chat(
        &state.http,
        &state.runtime.upstream,
        token.as_deref(),
        &upstream_req,
    )
    .await
    .map_err(upstream_error_to_app)?;

    if req.wants_stream() {
        return Ok(translate::passthrough_response(upstream_resp));
    }

    let options = AggregateOptions {
        model: req.model.clone(),
        tools_active,
        split_thinking_tags: features.thinking_prompt,
        scan_limit: features.tool_scan_limit,
    };
    let completion = translate::aggregate_stream(upstream_resp.bytes_stream(), &options)
        .await
        .map_err(|err| {
            metrics::counter!("zlink_upstream_errors_total").increment(1);
            tracing::warn!(model = %req.model, "aggregation failed: {err}");
            AppError::from(err)
        })?;
    Ok(Json(completion).into_response())
}

fn upstream_error_to_app(err: UpstreamCallError) -> AppError {
    metrics::counter!("zlink_upstream_errors_total").increment(1);
    tracing::warn!("upstream call failed: {}", err.message);
    match (err.kind, err.status) {
        (UpstreamErrorKind::Http, Some(status)) => {
            AppError::upstream_status(status, err.body.unwrap_or(err.message))
        }
        _ => AppError::upstream_unavailable(err.message),
    }
}
