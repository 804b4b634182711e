use crate::config::UpstreamConfig;
use crate::model_registry::{ModelFeatures, ObservedModel, UpstreamTarget};
use crate::preprocess::PreparedMessage;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

pub const CHAT_PATH: &str = "/api/chat/completions";
pub const MODELS_PATH: &str = "/api/models";
pub const AUTH_PATH: &str = "/api/v1/auths/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    Decode,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub body: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            body: None,
            message,
        }
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    pub stream: bool,
    pub model: String,
    pub messages: Vec<PreparedMessage>,
    pub params: Map<String, Value>,
    pub features: ModelFeatures,
    pub background_tasks: BackgroundTasks,
    pub mcp_servers: Vec<String>,
    pub model_item: ModelItem,
    pub tool_servers: Vec<String>,
    pub variables: BTreeMap<String, String>,
    pub chat_id: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackgroundTasks {
    pub title_generation: bool,
    pub tags_generation: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelItem {
    pub id: String,
    pub name: String,
    pub owned_by: String,
}

/// Sampling knobs copied from the client request into `params`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SamplingParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
}

pub fn build_upstream_request(
    target: &UpstreamTarget,
    messages: Vec<PreparedMessage>,
    sampling: SamplingParams,
    upstream: &UpstreamConfig,
    now: chrono::DateTime<chrono::Local>,
) -> UpstreamRequest {
    let mut params = Map::new();
    if let Some(v) = sampling.temperature {
        params.insert("temperature".to_string(), Value::from(v));
    }
    if let Some(v) = sampling.top_p {
        params.insert("top_p".to_string(), Value::from(v));
    }
    if let Some(v) = sampling.max_tokens {
        params.insert("max_tokens".to_string(), Value::from(v));
    }

    UpstreamRequest {
        stream: true,
        model: target.upstream_model_id.clone(),
        messages,
        params,
        features: target.features,
        background_tasks: BackgroundTasks {
            title_generation: false,
            tags_generation: false,
        },
        mcp_servers: target.mcp_servers.clone(),
        model_item: ModelItem {
            id: target.upstream_model_id.clone(),
            name: target.upstream_model_name.clone(),
            owned_by: "openai".to_string(),
        },
        tool_servers: Vec::new(),
        variables: template_variables(upstream, now),
        chat_id: uuid::Uuid::new_v4().to_string(),
        id: uuid::Uuid::new_v4().to_string(),
    }
}

fn template_variables(
    upstream: &UpstreamConfig,
    now: chrono::DateTime<chrono::Local>,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("{{USER_NAME}}".to_string(), upstream.user_name.clone());
    vars.insert("{{USER_LOCATION}}".to_string(), upstream.user_location.clone());
    vars.insert(
        "{{CURRENT_DATETIME}}".to_string(),
        now.format("%Y-%m-%d %H:%M:%S").to_string(),
    );
    vars.insert("{{CURRENT_DATE}}".to_string(), now.format("%Y-%m-%d").to_string());
    vars.insert("{{CURRENT_TIME}}".to_string(), now.format("%H:%M:%S").to_string());
    vars.insert("{{CURRENT_WEEKDAY}}".to_string(), now.format("%A").to_string());
    vars.insert("{{CURRENT_TIMEZONE}}".to_string(), now.format("%:z").to_string());
    vars.insert("{{USER_LANGUAGE}}".to_string(), "en-US".to_string());
    vars
}

/// Issue the chat call. The returned response has a 2xx status and an
/// unread SSE body.
pub async fn call_chat(
    client: &reqwest::Client,
    upstream: &UpstreamConfig,
    token: Option<&str>,
    body: &UpstreamRequest,
) -> Result<reqwest::Response, UpstreamCallError> {
    let mut req = client
        .post(join_url(&upstream.base_url, CHAT_PATH))
        .timeout(Duration::from_millis(upstream.chat_timeout_ms))
        .header(reqwest::header::ACCEPT, mime::TEXT_EVENT_STREAM.as_ref())
        .json(body);
    if let Some(token) = token {
        req = req.bearer_auth(token);
    }
    let resp = req
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    ensure_success(resp).await
}

#[derive(Debug, Deserialize)]
struct ModelListResponse {
    #[serde(default)]
    data: Vec<ObservedModel>,
}

pub async fn fetch_models(
    client: &reqwest::Client,
    upstream: &UpstreamConfig,
) -> Result<Vec<ObservedModel>, UpstreamCallError> {
    let token = acquire_token(client, upstream).await;
    let mut req = client
        .get(join_url(&upstream.base_url, MODELS_PATH))
        .timeout(Duration::from_millis(upstream.discovery_timeout_ms));
    if let Some(token) = token.as_deref() {
        req = req.bearer_auth(token);
    }
    let resp = req
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let resp = ensure_success(resp).await?;
    let status = resp.status();
    let text = resp.text().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Network, Some(status), err.to_string())
    })?;
    let list: ModelListResponse = serde_json::from_str(&text).map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Decode, Some(status), err.to_string())
    })?;
    Ok(list.data)
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    token: Option<String>,
}

/// Token for upstream calls: the configured one, else an anonymous session
/// token when that mode is on.
pub async fn acquire_token(client: &reqwest::Client, upstream: &UpstreamConfig) -> Option<String> {
    if let Some(token) = upstream.token.clone() {
        return Some(token);
    }
    if !upstream.anonymous_token {
        return None;
    }
    match fetch_anonymous_token(client, upstream).await {
        Ok(token) => Some(token),
        Err(err) => {
            tracing::warn!("anonymous token unavailable: {}", err.message);
            None
        }
    }
}

async fn fetch_anonymous_token(
    client: &reqwest::Client,
    upstream: &UpstreamConfig,
) -> Result<String, UpstreamCallError> {
    let resp = client
        .get(join_url(&upstream.base_url, AUTH_PATH))
        .timeout(Duration::from_millis(upstream.discovery_timeout_ms))
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let resp = ensure_success(resp).await?;
    let status = resp.status();
    let auth: AuthResponse = resp.json().await.map_err(|err| {
        UpstreamCallError::new(UpstreamErrorKind::Decode, Some(status), err.to_string())
    })?;
    auth.token.filter(|t| !t.is_empty()).ok_or_else(|| {
        UpstreamCallError::new(
            UpstreamErrorKind::Decode,
            Some(status),
            "auth response carried no token".to_string(),
        )
    })
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, UpstreamCallError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(UpstreamCallError::new(
        UpstreamErrorKind::Http,
        Some(status),
        format!("upstream status {}: {}", status, text),
    )
    .with_body(text))
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn target() -> UpstreamTarget {
        UpstreamTarget {
            upstream_model_id: "0727-360B-API".to_string(),
            upstream_model_name: "GLM-4.5".to_string(),
            features: ModelFeatures {
                enable_thinking: true,
                web_search: true,
                auto_web_search: false,
            },
            mcp_servers: vec!["deep-web-search".to_string()],
        }
    }

    #[test]
    fn upstream_request_carries_features_and_variables() {
        let now = chrono::Local
            .with_ymd_and_hms(2025, 8, 1, 9, 30, 0)
            .single()
            .expect("valid local time");
        let req = build_upstream_request(
            &target(),
            vec![PreparedMessage::user("hi")],
            SamplingParams {
                temperature: Some(0.5),
                ..SamplingParams::default()
            },
            &UpstreamConfig::default(),
            now,
        );
        let value = serde_json::to_value(&req).expect("serialize");
        assert_eq!(value["stream"], true);
        assert_eq!(value["model"], "0727-360B-API");
        assert_eq!(value["model_item"]["name"], "GLM-4.5");
        assert_eq!(value["features"]["enable_thinking"], true);
        assert_eq!(value["features"]["auto_web_search"], false);
        assert_eq!(value["mcp_servers"][0], "deep-web-search");
        assert_eq!(value["params"]["temperature"], 0.5);
        assert!(value["params"].get("top_p").is_none());
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["variables"]["{{USER_NAME}}"], "User");
        assert_eq!(value["variables"]["{{CURRENT_DATETIME}}"], "2025-08-01 09:30:00");
        assert_eq!(value["variables"]["{{CURRENT_WEEKDAY}}"], "Friday");
        assert_ne!(value["chat_id"], value["id"]);
    }

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(
            join_url("https://chat.z.ai/", "/api/models"),
            "https://chat.z.ai/api/models"
        );
        assert_eq!(join_url("http://h:1", ""), "http://h:1");
    }
}
