use std::str::FromStr;

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://chat.z.ai";
pub const DEFAULT_TOOL_SCAN_LIMIT: usize = 200_000;
pub const DEFAULT_CHAT_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub upstream: UpstreamConfig,
    /// Client-facing bearer key. `None` disables client authentication.
    pub api_key: Option<String>,
    pub features: FeatureConfig,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub anonymous_token: bool,
    pub chat_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    pub user_name: String,
    pub user_location: String,
}

#[derive(Debug, Clone)]
pub struct FeatureConfig {
    pub tool_support: bool,
    pub thinking_prompt: bool,
    pub tool_scan_limit: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            token: None,
            anonymous_token: true,
            chat_timeout_ms: DEFAULT_CHAT_TIMEOUT_MS,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            user_name: "User".to_string(),
            user_location: "Unknown".to_string(),
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            tool_support: true,
            thinking_prompt: false,
            tool_scan_limit: DEFAULT_TOOL_SCAN_LIMIT,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let upstream = UpstreamConfig {
            base_url: env_string("ZLINK_UPSTREAM_BASE_URL")
                .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string()),
            token: env_string("ZLINK_UPSTREAM_TOKEN"),
            anonymous_token: env_parse("ZLINK_ANONYMOUS_TOKEN").unwrap_or(true),
            chat_timeout_ms: env_parse("ZLINK_CHAT_TIMEOUT_MS")
                .unwrap_or(DEFAULT_CHAT_TIMEOUT_MS)
                .max(1),
            discovery_timeout_ms: env_parse("ZLINK_DISCOVERY_TIMEOUT_MS")
                .unwrap_or(DEFAULT_DISCOVERY_TIMEOUT_MS)
                .max(1),
            user_name: env_string("ZLINK_USER_NAME").unwrap_or_else(|| "User".to_string()),
            user_location: env_string("ZLINK_USER_LOCATION")
                .unwrap_or_else(|| "Unknown".to_string()),
        };
        let features = FeatureConfig {
            tool_support: env_parse("ZLINK_TOOL_SUPPORT").unwrap_or(true),
            thinking_prompt: env_parse("ZLINK_THINKING_PROMPT").unwrap_or(false),
            tool_scan_limit: env_parse("ZLINK_TOOL_SCAN_LIMIT").unwrap_or(DEFAULT_TOOL_SCAN_LIMIT),
        };
        Self {
            listen: env_string("ZLINK_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            metrics_path: env_string("ZLINK_METRICS_PATH")
                .unwrap_or_else(|| "/metrics".to_string()),
            upstream,
            api_key: env_string("ZLINK_API_KEY"),
            features,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    if let Ok(value) = raw.parse() {
        return Some(value);
    }
    match raw.to_ascii_lowercase().as_str() {
        "1" | "yes" | "on" | "true" => "true".parse().ok(),
        "0" | "no" | "off" | "false" => "false".parse().ok(),
        _ => None,
    }
}
