//! Effective in-memory configuration.
//!
//! Priority: environment variable > persisted config entry > default.
//! The result is an immutable snapshot passed through the request
//! context; reloads swap a new snapshot in, nothing mutates in place.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as JsonValue;

use agproxy_protocol::models;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_password: String,
    pub panel_password: String,
    pub host: String,
    pub port: u16,
    pub credentials_dir: String,
    pub antigravity_api_url: Option<String>,
    pub proxy: Option<String>,

    pub auto_ban: bool,
    pub auto_ban_error_codes: Vec<u16>,

    pub retry_429_enabled: bool,
    pub retry_429_max_retries: u32,
    pub retry_429_interval: Duration,
    pub anti_truncation_max_attempts: u32,

    pub compatibility_mode: bool,
    pub return_thoughts_to_frontend: bool,

    pub max_credential_switches: u32,
    pub max_same_cred_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub request_timeout: Duration,
    pub stream_timeout: Duration,
    pub first_chunk_timeout: Duration,
    pub first_chunk_failure_cooldown: Duration,
    pub max_concurrency: usize,
    pub min_request_interval: Duration,

    pub background_refresh_enabled: bool,
    pub background_refresh_interval: Duration,
    pub quota_protection_enabled: bool,
    pub quota_protection_threshold: f64,
    pub quota_protection_models: Vec<String>,
    pub smart_warmup_enabled: bool,
    pub auto_verify_enabled: bool,

    pub empty_response_fallback: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_password: String::new(),
            panel_password: String::new(),
            host: "0.0.0.0".to_string(),
            port: 7861,
            credentials_dir: "./creds".to_string(),
            antigravity_api_url: None,
            proxy: None,
            auto_ban: false,
            auto_ban_error_codes: vec![403],
            retry_429_enabled: true,
            retry_429_max_retries: 5,
            retry_429_interval: Duration::from_millis(100),
            anti_truncation_max_attempts: 3,
            compatibility_mode: true,
            return_thoughts_to_frontend: true,
            max_credential_switches: 5,
            max_same_cred_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(1800),
            request_timeout: Duration::from_secs(120),
            stream_timeout: Duration::from_secs(300),
            first_chunk_timeout: Duration::from_secs(15),
            first_chunk_failure_cooldown: Duration::from_secs(5),
            max_concurrency: 2,
            min_request_interval: Duration::from_millis(500),
            background_refresh_enabled: false,
            background_refresh_interval: Duration::from_secs(15 * 60),
            quota_protection_enabled: false,
            quota_protection_threshold: 0.2,
            quota_protection_models: Vec::new(),
            smart_warmup_enabled: false,
            auto_verify_enabled: false,
            empty_response_fallback: true,
        }
    }
}

impl GatewayConfig {
    /// Merge env vars over persisted entries over defaults.
    pub fn load(env: &HashMap<String, String>, persisted: &HashMap<String, JsonValue>) -> Self {
        let mut config = GatewayConfig::default();
        let get = |key: &str| -> Option<String> {
            env.get(key).cloned().or_else(|| {
                persisted.get(&key.to_ascii_lowercase()).map(|value| match value {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                })
            })
        };

        if let Some(value) = get("API_PASSWORD") {
            config.api_password = value;
        }
        if let Some(value) = get("PANEL_PASSWORD") {
            config.panel_password = value;
        }
        if let Some(value) = get("HOST") {
            config.host = value;
        }
        if let Some(value) = get("PORT").and_then(|v| v.parse().ok()) {
            config.port = value;
        }
        if let Some(value) = get("CREDENTIALS_DIR") {
            config.credentials_dir = value;
        }
        if let Some(value) = get("ANTIGRAVITY_API_URL") {
            config.antigravity_api_url = Some(value);
        }
        if let Some(value) = get("PROXY") {
            config.proxy = Some(value);
        }
        if let Some(value) = get("AUTO_BAN") {
            config.auto_ban = parse_bool(&value);
        }
        if let Some(value) = get("AUTO_BAN_ERROR_CODES") {
            config.auto_ban_error_codes = parse_u16_list(&value);
        }
        if let Some(value) = get("RETRY_429_ENABLED") {
            config.retry_429_enabled = parse_bool(&value);
        }
        if let Some(value) = get("RETRY_429_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            config.retry_429_max_retries = value;
        }
        if let Some(value) = get("RETRY_429_INTERVAL").and_then(|v| v.parse::<f64>().ok()) {
            config.retry_429_interval = Duration::from_secs_f64(value);
        }
        if let Some(value) = get("ANTI_TRUNCATION_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            config.anti_truncation_max_attempts = value;
        }
        if let Some(value) = get("COMPATIBILITY_MODE") {
            config.compatibility_mode = parse_bool(&value);
        }
        if let Some(value) = get("RETURN_THOUGHTS_TO_FRONTEND") {
            config.return_thoughts_to_frontend = parse_bool(&value);
        }
        if let Some(value) = get("ANTIGRAVITY_MAX_CONCURRENCY").and_then(|v| v.parse().ok()) {
            config.max_concurrency = value;
        }
        if let Some(value) =
            get("ANTIGRAVITY_MIN_REQUEST_INTERVAL_SECONDS").and_then(|v| v.parse::<f64>().ok())
        {
            config.min_request_interval = Duration::from_secs_f64(value);
        }
        if let Some(value) = get("BACKGROUND_REFRESH_ENABLED") {
            config.background_refresh_enabled = parse_bool(&value);
        }
        if let Some(value) =
            get("BACKGROUND_REFRESH_INTERVAL_MINUTES").and_then(|v| v.parse::<u64>().ok())
        {
            config.background_refresh_interval = Duration::from_secs(value * 60);
        }
        if let Some(value) = get("QUOTA_PROTECTION_ENABLED") {
            config.quota_protection_enabled = parse_bool(&value);
        }
        if let Some(value) = get("QUOTA_PROTECTION_THRESHOLD").and_then(|v| v.parse().ok()) {
            config.quota_protection_threshold = value;
        }
        if let Some(value) = get("QUOTA_PROTECTION_MODELS") {
            config.quota_protection_models = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(value) = get("SMART_WARMUP_ENABLED") {
            config.smart_warmup_enabled = parse_bool(&value);
        }
        if let Some(value) = get("AUTO_VERIFY_ENABLED") {
            config.auto_verify_enabled = parse_bool(&value);
        }
        if let Some(value) = get("EMPTY_RESPONSE_FALLBACK") {
            config.empty_response_fallback = parse_bool(&value);
        }
        config
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_u16_list(value: &str) -> Vec<u16> {
    value
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

/// `${VAR}` / `${VAR:default}` interpolation over YAML scalars.
pub fn expand_env_vars(value: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let Some(end) = rest[start..].find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let token = &rest[start + 2..start + end];
        let (name, default) = match token.split_once(':') {
            Some((name, default)) => (name, Some(default)),
            None => (token, None),
        };
        match env.get(name) {
            Some(found) => out.push_str(found),
            None => out.push_str(default.unwrap_or("")),
        }
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    out
}

/// How a backend speaks: the Antigravity internal API natively, or an
/// OpenAI-compatible sibling proxied with minimal translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendDialect {
    Antigravity,
    OpenAi,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub name: String,
    pub dialect: BackendDialect,
    /// Ordered failover list; the first URL is preferred.
    pub base_urls: Vec<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub priority: i32,
    /// Supported client aliases; empty means all.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_enabled() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_stream_timeout_secs() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    2
}

impl BackendConfig {
    pub fn antigravity_default(base_url_override: Option<&str>) -> Self {
        BackendConfig {
            name: "antigravity".to_string(),
            dialect: BackendDialect::Antigravity,
            base_urls: vec![
                base_url_override
                    .unwrap_or(agproxy_protocol::antigravity::DEFAULT_BASE_URL)
                    .to_string(),
            ],
            api_key: None,
            priority: 0,
            models: Vec::new(),
            enabled: true,
            timeout_secs: default_timeout_secs(),
            stream_timeout_secs: default_stream_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }

    pub fn supports(&self, alias: &str) -> bool {
        self.enabled && (self.models.is_empty() || self.models.iter().any(|m| m == alias))
    }
}

/// Conditions (beyond status codes) that advance the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackCondition {
    Status(u16),
    Timeout,
    ConnectionError,
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    /// Ordered `(backend_name, target_model)` chain; tried front to back.
    pub chain: Vec<(String, String)>,
    pub fallback_on: Vec<FallbackCondition>,
    pub enabled: bool,
}

impl RoutingRule {
    pub fn should_fallback_status(&self, status: u16) -> bool {
        self.fallback_on
            .iter()
            .any(|condition| matches!(condition, FallbackCondition::Status(s) if *s == status))
    }

    pub fn should_fallback_transport(&self, timeout: bool) -> bool {
        self.fallback_on.iter().any(|condition| {
            matches!(condition, FallbackCondition::Timeout) && timeout
                || matches!(condition, FallbackCondition::ConnectionError) && !timeout
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    pub backends: HashMap<String, BackendConfig>,
    pub rules: HashMap<String, RoutingRule>,
}

impl RoutingTable {
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.get(name).filter(|backend| backend.enabled)
    }

    /// Resolve the chain for a client alias: explicit rule first (with
    /// `-thinking`/date suffix-stripped fallback keys), then the
    /// model-family default of a single antigravity entry.
    pub fn resolve(&self, alias: &str) -> RoutingRule {
        for key in models::routing_keys(alias) {
            if let Some(rule) = self.rules.get(&key)
                && rule.enabled
                && !rule.chain.is_empty()
            {
                return rule.clone();
            }
        }
        let resolved = models::resolve(alias);
        RoutingRule {
            chain: vec![("antigravity".to_string(), resolved.upstream)],
            fallback_on: vec![
                FallbackCondition::Status(429),
                FallbackCondition::Status(503),
                FallbackCondition::Timeout,
                FallbackCondition::ConnectionError,
                FallbackCondition::Unavailable,
            ],
            enabled: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawGatewayFile {
    #[serde(default)]
    backends: HashMap<String, RawBackend>,
    #[serde(default)]
    model_routes: HashMap<String, RawRoute>,
}

#[derive(Debug, Deserialize)]
struct RawBackend {
    dialect: BackendDialect,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    base_urls: Vec<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    models: Vec<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default = "default_stream_timeout_secs")]
    stream_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
struct RawRoute {
    #[serde(default)]
    chain: Vec<RawChainEntry>,
    #[serde(default)]
    fallback_on: Vec<JsonValue>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct RawChainEntry {
    backend: String,
    model: String,
}

#[derive(Debug)]
pub struct ConfigParseError(pub String);

impl std::fmt::Display for ConfigParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gateway config: {}", self.0)
    }
}

impl std::error::Error for ConfigParseError {}

/// Parse the gateway YAML (backends + model routes) with `${VAR:default}`
/// interpolation applied to the raw text first.
pub fn parse_routing_yaml(
    yaml: &str,
    env: &HashMap<String, String>,
) -> Result<RoutingTable, ConfigParseError> {
    let expanded = expand_env_vars(yaml, env);
    let raw: RawGatewayFile =
        serde_yaml::from_str(&expanded).map_err(|err| ConfigParseError(err.to_string()))?;

    let mut backends = HashMap::new();
    for (name, raw_backend) in raw.backends {
        let mut base_urls = raw_backend.base_urls;
        if let Some(single) = raw_backend.base_url {
            base_urls.insert(0, single);
        }
        if base_urls.is_empty() {
            return Err(ConfigParseError(format!("backend {name} has no base URL")));
        }
        backends.insert(
            name.clone(),
            BackendConfig {
                name,
                dialect: raw_backend.dialect,
                base_urls,
                api_key: raw_backend.api_key.filter(|key| !key.is_empty()),
                priority: raw_backend.priority,
                models: raw_backend.models,
                enabled: raw_backend.enabled,
                timeout_secs: raw_backend.timeout_secs,
                stream_timeout_secs: raw_backend.stream_timeout_secs,
                max_retries: raw_backend.max_retries,
            },
        );
    }
    backends
        .entry("antigravity".to_string())
        .or_insert_with(|| BackendConfig::antigravity_default(None));

    let mut rules = HashMap::new();
    for (alias, raw_route) in raw.model_routes {
        let chain = raw_route
            .chain
            .into_iter()
            .map(|entry| (entry.backend, entry.model))
            .collect::<Vec<_>>();
        if chain.is_empty() && raw_route.enabled {
            return Err(ConfigParseError(format!(
                "route {alias} is enabled but has an empty chain"
            )));
        }
        let fallback_on = raw_route
            .fallback_on
            .iter()
            .filter_map(|value| match value {
                JsonValue::Number(n) => n.as_u64().map(|s| FallbackCondition::Status(s as u16)),
                JsonValue::String(s) => match s.as_str() {
                    "timeout" => Some(FallbackCondition::Timeout),
                    "connection_error" => Some(FallbackCondition::ConnectionError),
                    "unavailable" => Some(FallbackCondition::Unavailable),
                    other => other.parse().ok().map(FallbackCondition::Status),
                },
                _ => None,
            })
            .collect();
        rules.insert(
            alias.to_ascii_lowercase(),
            RoutingRule {
                chain,
                fallback_on,
                enabled: raw_route.enabled,
            },
        );
    }

    Ok(RoutingTable { backends, rules })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn env_beats_persisted_beats_default() {
        let environment = env(&[("PORT", "9000"), ("AUTO_BAN", "true")]);
        let mut persisted = HashMap::new();
        persisted.insert("port".to_string(), serde_json::json!("8000"));
        persisted.insert("host".to_string(), serde_json::json!("127.0.0.1"));
        let config = GatewayConfig::load(&environment, &persisted);
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "127.0.0.1");
        assert!(config.auto_ban);
        assert_eq!(config.credentials_dir, "./creds");
    }

    #[test]
    fn var_interpolation_with_defaults() {
        let environment = env(&[("KIRO_URL", "http://kiro:9046")]);
        assert_eq!(
            expand_env_vars("${KIRO_URL}/api", &environment),
            "http://kiro:9046/api"
        );
        assert_eq!(
            expand_env_vars("${MISSING:http://fallback}/api", &environment),
            "http://fallback/api"
        );
        assert_eq!(expand_env_vars("${MISSING}", &environment), "");
    }

    #[test]
    fn routing_yaml_parses_chain_and_fallbacks() {
        let yaml = r#"
backends:
  kiro-gateway:
    dialect: open_ai
    base_url: ${KIRO_URL:http://localhost:9046}
    api_key: ${KIRO_KEY:}
model_routes:
  claude-sonnet-4.5:
    chain:
      - backend: kiro-gateway
        model: claude-sonnet-4.5
      - backend: antigravity
        model: claude-sonnet-4-5
    fallback_on: [429, 503, timeout]
"#;
        let table = parse_routing_yaml(yaml, &HashMap::new()).unwrap();
        let rule = table.resolve("Claude-Sonnet-4.5");
        assert_eq!(rule.chain.len(), 2);
        assert_eq!(rule.chain[0].0, "kiro-gateway");
        assert!(rule.should_fallback_status(429));
        assert!(rule.should_fallback_status(503));
        assert!(!rule.should_fallback_status(400));
        assert!(rule.should_fallback_transport(true));
        // Empty api_key collapses to None.
        assert!(table.backend("kiro-gateway").unwrap().api_key.is_none());
        // The antigravity backend is always present.
        assert!(table.backend("antigravity").is_some());
    }

    #[test]
    fn unrouted_alias_falls_to_family_default() {
        let table = RoutingTable {
            backends: HashMap::from([(
                "antigravity".to_string(),
                BackendConfig::antigravity_default(None),
            )]),
            rules: HashMap::new(),
        };
        let rule = table.resolve("gemini-3-pro");
        assert_eq!(rule.chain[0].0, "antigravity");
        assert_eq!(rule.chain[0].1, "gemini-3-pro-high");
    }

    #[test]
    fn thinking_suffix_falls_back_to_base_rule() {
        let yaml = r#"
model_routes:
  claude-sonnet-4-5:
    chain:
      - backend: antigravity
        model: claude-sonnet-4-5
    fallback_on: [429]
"#;
        let table = parse_routing_yaml(yaml, &HashMap::new()).unwrap();
        let rule = table.resolve("claude-sonnet-4-5-thinking");
        assert_eq!(rule.chain[0].1, "claude-sonnet-4-5");
    }
}
