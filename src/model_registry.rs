use crate::config::UpstreamConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

pub const MAPPING_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModelFeatures {
    pub enable_thinking: bool,
    pub web_search: bool,
    pub auto_web_search: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelMapping {
    pub display_name: String,
    pub upstream_model_id: String,
    pub upstream_model_name: String,
    pub features: ModelFeatures,
    pub mcp_servers: Vec<String>,
    pub owned_by: String,
    pub is_builtin: bool,
    pub description: String,
}

/// What the upstream needs to know about a resolved model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub upstream_model_id: String,
    pub upstream_model_name: String,
    pub features: ModelFeatures,
    pub mcp_servers: Vec<String>,
}

impl From<&ModelMapping> for UpstreamTarget {
    fn from(mapping: &ModelMapping) -> Self {
        Self {
            upstream_model_id: mapping.upstream_model_id.clone(),
            upstream_model_name: mapping.upstream_model_name.clone(),
            features: mapping.features,
            mcp_servers: mapping.mcp_servers.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub owned_by: String,
    pub description: Option<String>,
}

/// One entry of the upstream model list.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservedModel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub owned_by: Option<String>,
    #[serde(default)]
    pub info: Option<Value>,
}

struct BuiltinModel {
    id: &'static str,
    display_name: &'static str,
    upstream_model_id: &'static str,
    upstream_model_name: &'static str,
    features: ModelFeatures,
    mcp_servers: &'static [&'static str],
    description: &'static str,
}

const PLAIN: ModelFeatures = ModelFeatures {
    enable_thinking: false,
    web_search: false,
    auto_web_search: false,
};

const THINKING: ModelFeatures = ModelFeatures {
    enable_thinking: true,
    web_search: false,
    auto_web_search: false,
};

const SEARCH: ModelFeatures = ModelFeatures {
    enable_thinking: true,
    web_search: true,
    auto_web_search: true,
};

static BUILTIN_MODELS: &[BuiltinModel] = &[
    BuiltinModel {
        id: "GLM-4.5",
        display_name: "GLM-4.5",
        upstream_model_id: "0727-360B-API",
        upstream_model_name: "GLM-4.5",
        features: PLAIN,
        mcp_servers: &[],
        description: "general chat without a thinking phase",
    },
    BuiltinModel {
        id: "GLM-4.5-Thinking",
        display_name: "GLM-4.5 Thinking",
        upstream_model_id: "0727-360B-API",
        upstream_model_name: "GLM-4.5",
        features: THINKING,
        mcp_servers: &[],
        description: "chat with the upstream thinking phase enabled",
    },
    BuiltinModel {
        id: "GLM-4.5-Search",
        display_name: "GLM-4.5 Search",
        upstream_model_id: "0727-360B-API",
        upstream_model_name: "GLM-4.5",
        features: SEARCH,
        mcp_servers: &["deep-web-search"],
        description: "chat with web search through the deep-web-search server",
    },
    BuiltinModel {
        id: "GLM-4.5-Air",
        display_name: "GLM-4.5-Air",
        upstream_model_id: "0727-106B-API",
        upstream_model_name: "GLM-4.5-Air",
        features: PLAIN,
        mcp_servers: &[],
        description: "lightweight chat model",
    },
    BuiltinModel {
        id: "GLM-4.5V",
        display_name: "GLM-4.5V",
        upstream_model_id: "glm-4.5v",
        upstream_model_name: "GLM-4.5V",
        features: THINKING,
        mcp_servers: &[],
        description: "vision-capable chat model",
    },
];

impl BuiltinModel {
    fn to_mapping(&self) -> ModelMapping {
        ModelMapping {
            display_name: self.display_name.to_string(),
            upstream_model_id: self.upstream_model_id.to_string(),
            upstream_model_name: self.upstream_model_name.to_string(),
            features: self.features,
            mcp_servers: self.mcp_servers.iter().map(|s| s.to_string()).collect(),
            owned_by: "z.ai".to_string(),
            is_builtin: true,
            description: self.description.to_string(),
        }
    }
}

fn builtin(id: &str) -> Option<&'static BuiltinModel> {
    BUILTIN_MODELS.iter().find(|model| model.id == id)
}

fn collides_with_builtin(id: &str) -> bool {
    BUILTIN_MODELS
        .iter()
        .any(|model| model.id == id || model.upstream_model_id == id)
}

#[derive(Default)]
struct CacheState {
    dynamic: HashMap<String, ModelMapping>,
    last_update: Option<Instant>,
}

/// Builtin plus discovered model mappings, shared by every request.
#[derive(Clone)]
pub struct MappingCache {
    inner: Arc<RwLock<CacheState>>,
    ttl: Duration,
}

impl Default for MappingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingCache {
    pub fn new() -> Self {
        Self::with_ttl(MAPPING_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheState::default())),
            ttl,
        }
    }

    pub async fn resolve(&self, model_id: &str) -> Option<UpstreamTarget> {
        if let Some(model) = builtin(model_id) {
            return Some(UpstreamTarget::from(&model.to_mapping()));
        }
        let guard = self.inner.read().await;
        guard.dynamic.get(model_id).map(UpstreamTarget::from)
    }

    #[cfg(test)]
    pub async fn mapping(&self, model_id: &str) -> Option<ModelMapping> {
        if let Some(model) = builtin(model_id) {
            return Some(model.to_mapping());
        }
        let guard = self.inner.read().await;
        guard.dynamic.get(model_id).cloned()
    }

    pub async fn is_stale(&self) -> bool {
        let guard = self.inner.read().await;
        is_stale(&guard, self.ttl)
    }

    #[cfg(test)]
    pub async fn last_update(&self) -> Option<Instant> {
        self.inner.read().await.last_update
    }

    /// Replace the dynamic mappings with `observed`, unless the previous
    /// replacement is younger than the TTL. Returns whether a swap happened.
    pub async fn refresh(&self, observed: Vec<ObservedModel>) -> bool {
        let mut guard = self.inner.write().await;
        if !is_stale(&guard, self.ttl) {
            return false;
        }
        let mut dynamic = HashMap::with_capacity(observed.len());
        for model in observed {
            let id = model.id.trim();
            if id.is_empty() || collides_with_builtin(id) {
                continue;
            }
            dynamic.insert(id.to_string(), dynamic_mapping(id, &model));
        }
        tracing::debug!(dynamic_models = dynamic.len(), "model mappings replaced");
        guard.dynamic = dynamic;
        guard.last_update = Some(Instant::now());
        true
    }

    /// Best-effort discovery. Failures leave the cache untouched.
    pub async fn refresh_from_upstream(&self, http: &reqwest::Client, upstream: &UpstreamConfig) {
        if !self.is_stale().await {
            return;
        }
        match crate::upstream::fetch_models(http, upstream).await {
            Ok(observed) => {
                if self.refresh(observed).await {
                    metrics::counter!("zlink_model_refresh_total", "outcome" => "replaced")
                        .increment(1);
                }
            }
            Err(err) => {
                metrics::counter!("zlink_model_refresh_total", "outcome" => "failed").increment(1);
                tracing::warn!("model discovery failed, serving cached mappings: {}", err.message);
            }
        }
    }

    pub async fn list_all(&self) -> Vec<ModelDescriptor> {
        let mut out: Vec<ModelDescriptor> = BUILTIN_MODELS
            .iter()
            .map(|model| descriptor(model.id, &model.to_mapping()))
            .collect();
        let guard = self.inner.read().await;
        let mut dynamic: Vec<ModelDescriptor> = guard
            .dynamic
            .iter()
            .filter(|(id, _)| builtin(id).is_none())
            .map(|(id, mapping)| descriptor(id, mapping))
            .collect();
        dynamic.sort_by(|a, b| a.id.cmp(&b.id));
        out.extend(dynamic);
        out
    }

    #[cfg(test)]
    pub async fn reset(&self) {
        let mut guard = self.inner.write().await;
        guard.dynamic.clear();
        guard.last_update = None;
    }
}

fn is_stale(state: &CacheState, ttl: Duration) -> bool {
    match state.last_update {
        Some(at) => at.elapsed() >= ttl,
        None => true,
    }
}

/// Only builtin entries publish a description.
fn descriptor(id: &str, mapping: &ModelMapping) -> ModelDescriptor {
    ModelDescriptor {
        id: id.to_string(),
        display_name: mapping.display_name.clone(),
        owned_by: mapping.owned_by.clone(),
        description: mapping.is_builtin.then(|| mapping.description.clone()),
    }
}

fn dynamic_mapping(id: &str, model: &ObservedModel) -> ModelMapping {
    let display_name = model
        .name
        .as_deref()
        .or(model.display_name.as_deref())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(id)
        .to_string();
    let capabilities = model
        .info
        .as_ref()
        .and_then(|info| info.get("meta"))
        .and_then(|meta| meta.get("capabilities"));
    let enable_thinking = capabilities
        .and_then(|caps| caps.get("think"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    ModelMapping {
        upstream_model_id: id.to_string(),
        upstream_model_name: display_name.clone(),
        display_name,
        features: ModelFeatures {
            enable_thinking,
            ..ModelFeatures::default()
        },
        mcp_servers: Vec::new(),
        owned_by: model
            .owned_by
            .clone()
            .filter(|owner| !owner.is_empty())
            .unwrap_or_else(|| "z.ai".to_string()),
        is_builtin: false,
        description: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(id: &str, name: Option<&str>) -> ObservedModel {
        ObservedModel {
            id: id.to_string(),
            name: name.map(str::to_string),
            display_name: None,
            owned_by: None,
            info: None,
        }
    }

    #[tokio::test]
    async fn builtin_resolves_before_any_refresh() {
        let cache = MappingCache::new();
        let target = cache.resolve("GLM-4.5-Search").await.expect("builtin");
        assert_eq!(target.upstream_model_id, "0727-360B-API");
        assert!(target.features.web_search);
        assert_eq!(target.mcp_servers, vec!["deep-web-search".to_string()]);
        assert!(cache.resolve("unknown-model-xyz").await.is_none());
    }

    #[tokio::test]
    async fn refresh_skips_builtin_collisions() {
        let cache = MappingCache::new();
        let swapped = cache
            .refresh(vec![
                observed("0727-360B-API", Some("Impostor")),
                observed("GLM-4.5", Some("Impostor")),
                observed("new-model", Some("New Model")),
            ])
            .await;
        assert!(swapped);
        let builtin = cache.mapping("GLM-4.5").await.expect("builtin");
        assert!(builtin.is_builtin);
        assert_eq!(builtin.display_name, "GLM-4.5");
        assert!(cache.mapping("0727-360B-API").await.is_none());
        let dynamic = cache.mapping("new-model").await.expect("dynamic");
        assert!(!dynamic.is_builtin);
        assert_eq!(dynamic.display_name, "New Model");
    }

    #[tokio::test]
    async fn refresh_within_ttl_is_a_no_op() {
        let cache = MappingCache::new();
        assert!(cache.refresh(vec![observed("a", None)]).await);
        let first_update = cache.last_update().await;
        assert!(!cache.refresh(vec![observed("b", None)]).await);
        assert_eq!(cache.last_update().await, first_update);
        assert!(cache.resolve("a").await.is_some());
        assert!(cache.resolve("b").await.is_none());
    }

    #[tokio::test]
    async fn refresh_after_ttl_replaces_wholesale() {
        let cache = MappingCache::with_ttl(Duration::ZERO);
        assert!(cache.refresh(vec![observed("a", None)]).await);
        assert!(cache.refresh(vec![observed("b", None)]).await);
        assert!(cache.resolve("a").await.is_none());
        assert!(cache.resolve("b").await.is_some());
    }

    #[tokio::test]
    async fn list_all_puts_builtins_first_and_sorts_dynamic() {
        let cache = MappingCache::new();
        cache
            .refresh(vec![observed("zeta", None), observed("alpha", Some("Alpha"))])
            .await;
        let ids: Vec<String> = cache.list_all().await.into_iter().map(|m| m.id).collect();
        let builtin_count = BUILTIN_MODELS.len();
        assert_eq!(ids[0], "GLM-4.5");
        assert_eq!(&ids[builtin_count..], &["alpha".to_string(), "zeta".to_string()]);
    }

    #[tokio::test]
    async fn reset_clears_dynamic_mappings() {
        let cache = MappingCache::new();
        cache.refresh(vec![observed("a", None)]).await;
        cache.reset().await;
        assert!(cache.resolve("a").await.is_none());
        assert!(cache.last_update().await.is_none());
        assert!(cache.is_stale().await);
    }

    #[tokio::test]
    async fn dynamic_mapping_reads_thinking_capability() {
        let cache = MappingCache::new();
        let model: ObservedModel = serde_json::from_value(serde_json::json!({
            "id": "glm-z1",
            "display_name": "GLM Z1",
            "owned_by": "openai",
            "info": { "meta": { "capabilities": { "think": true } } }
        }))
        .expect("observed model");
        cache.refresh(vec![model]).await;
        let mapping = cache.mapping("glm-z1").await.expect("dynamic");
        assert_eq!(mapping.display_name, "GLM Z1");
        assert_eq!(mapping.owned_by, "openai");
        assert!(mapping.features.enable_thinking);
    }

    #[tokio::test]
    async fn builtin_resolution_is_stable_under_concurrent_refresh() {
        let cache = MappingCache::with_ttl(Duration::ZERO);
        let expected = cache.resolve("GLM-4.5-Thinking").await.expect("builtin");
        let mut handles = Vec::new();
        for round in 0..16 {
            let writer = cache.clone();
            handles.push(tokio::spawn(async move {
                writer
                    .refresh(vec![
                        observed("GLM-4.5-Thinking", Some("shadow")),
                        observed(&format!("m{round}"), None),
                    ])
                    .await;
            }));
            let reader = cache.clone();
            let expected = expected.clone();
            handles.push(tokio::spawn(async move {
                assert_eq!(reader.resolve("GLM-4.5-Thinking").await, Some(expected));
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }
    }
}
