pub mod validation;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Upstream request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Token refresh request timeout in seconds.
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    /// `1` selects the current-thread runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(default = "default_credential_refresh_interval_secs")]
    pub credential_refresh_interval_secs: u64,
    #[serde(default)]
    pub base_path: String,
}

fn default_port() -> u16 {
    3000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    300
}
fn default_refresh_timeout() -> u64 {
    15
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}
fn default_credential_refresh_interval_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            refresh_timeout: default_refresh_timeout(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            runtime_worker_threads: None,
            credential_refresh_interval_secs: default_credential_refresh_interval_secs(),
            base_path: String::new(),
        }
    }
}

/// Client authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAuthConfig {
    pub allowed_keys: Vec<String>,
}

/// Retry and rotation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Same-credential retries inside an adapter.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Orchestrator attempts per logical request, across credentials.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_rotation_jitter_max_ms")]
    pub rotation_jitter_max_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_rotation_jitter_max_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            rotation_jitter_max_ms: default_rotation_jitter_max_ms(),
        }
    }
}

/// Which provider type serves requests, and where to go when it has no
/// healthy credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default)]
    pub fallback_chain: HashMap<String, Vec<String>>,
}

fn default_provider() -> String {
    "claude-kiro-oauth".to_string()
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            fallback_chain: HashMap::new(),
        }
    }
}

/// One credential of a provider entry. Kiro credentials live in a file,
/// OpenAI-compatible ones are plain API keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Backend provider entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub provider: String,
    pub credentials: Vec<CredentialConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Overrides the advertised model list.
    #[serde(default)]
    pub models: Vec<String>,
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    #[serde(default = "default_context_budget_tokens")]
    pub context_budget_tokens: u64,
    #[serde(default = "default_reasoning_max_tokens")]
    pub reasoning_max_tokens: u64,
}

fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_context_budget_tokens() -> u64 {
    172_500
}
fn default_reasoning_max_tokens() -> u64 {
    20_000
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            context_budget_tokens: default_context_budget_tokens(),
            reasoning_max_tokens: default_reasoning_max_tokens(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub client_authentication: ClientAuthConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] or [`ConfigError::Validation`].
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.routing.default_provider, "claude-kiro-oauth");
        assert_eq!(
            config.routing.fallback_chain["claude-kiro-oauth"],
            vec!["openai-custom".to_string()]
        );
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let yaml = r"
client_authentication:
  allowed_keys: [k]
providers:
  - name: kiro
    provider: claude-kiro-oauth
    credentials:
      - id: a
        file: /tmp/a.json
";
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.server.timeout, 300);
        assert_eq!(config.server.refresh_timeout, 15);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.retry.rotation_jitter_max_ms, 10_000);
        assert_eq!(config.features.context_budget_tokens, 172_500);
        assert_eq!(config.features.reasoning_max_tokens, 20_000);
        assert!(!config.features.log_json);
    }
}
