use std::collections::HashSet;

use crate::protocol::canonical::ProviderKind;

use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_allowed_keys(config)?;
    validate_retry(config)?;
    validate_providers(config)?;
    validate_routing(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if server.timeout == 0 || server.refresh_timeout == 0 {
        return Err(validation_err(
            "server.timeout and server.refresh_timeout must be greater than 0",
        ));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    if server.credential_refresh_interval_secs == 0 {
        return Err(validation_err(
            "server.credential_refresh_interval_secs must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_allowed_keys(config: &AppConfig) -> Result<(), ConfigError> {
    if config.client_authentication.allowed_keys.is_empty() {
        return Err(validation_err("allowed_keys cannot be empty"));
    }
    for key in &config.client_authentication.allowed_keys {
        if key.trim().is_empty() {
            return Err(validation_err("allowed_keys contains an empty key"));
        }
    }
    Ok(())
}

fn validate_retry(config: &AppConfig) -> Result<(), ConfigError> {
    let retry = &config.retry;
    if retry.max_attempts == 0 {
        return Err(validation_err("retry.max_attempts must be greater than 0"));
    }
    if retry.max_delay_ms < retry.base_delay_ms {
        return Err(validation_err(
            "retry.max_delay_ms must not be smaller than retry.base_delay_ms",
        ));
    }
    Ok(())
}

fn parse_kind(name: &str, value: &str) -> Result<ProviderKind, ConfigError> {
    ProviderKind::parse(value).ok_or_else(|| {
        validation_err(format!(
            "{name}: unknown provider '{value}'. Must be one of: {}, {}",
            ProviderKind::Kiro.as_str(),
            ProviderKind::OpenAiCompatible.as_str()
        ))
    })
}

fn validate_providers(config: &AppConfig) -> Result<(), ConfigError> {
    if config.providers.is_empty() {
        return Err(validation_err("providers cannot be empty"));
    }

    let mut credential_ids = HashSet::new();
    for entry in &config.providers {
        let kind = parse_kind(&format!("Provider '{}'", entry.name), &entry.provider)?;
        if entry.credentials.is_empty() {
            return Err(validation_err(format!(
                "Provider '{}' must have at least one credential",
                entry.name
            )));
        }
        if kind == ProviderKind::OpenAiCompatible {
            let base_url = entry.base_url.as_deref().unwrap_or("");
            if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                return Err(validation_err(format!(
                    "Provider '{}': base_url must start with http:// or https://",
                    entry.name
                )));
            }
        }
        for credential in &entry.credentials {
            if credential.id.trim().is_empty() {
                return Err(validation_err(format!(
                    "Provider '{}': credential id cannot be empty",
                    entry.name
                )));
            }
            if credential.file.is_none() && credential.api_key.is_none() {
                return Err(validation_err(format!(
                    "Credential '{}': needs either file or api_key",
                    credential.id
                )));
            }
            if !credential_ids.insert(credential.id.as_str()) {
                return Err(validation_err(format!(
                    "Duplicate credential id '{}'",
                    credential.id
                )));
            }
        }
    }
    Ok(())
}

fn validate_routing(config: &AppConfig) -> Result<(), ConfigError> {
    let default = parse_kind("routing.default_provider", &config.routing.default_provider)?;
    let configured: HashSet<ProviderKind> = config
        .providers
        .iter()
        .filter_map(|entry| ProviderKind::parse(&entry.provider))
        .collect();
    if !configured.contains(&default) {
        return Err(validation_err(format!(
            "routing.default_provider '{}' has no provider entry",
            config.routing.default_provider
        )));
    }
    for (from, chain) in &config.routing.fallback_chain {
        parse_kind("routing.fallback_chain", from)?;
        for to in chain {
            parse_kind("routing.fallback_chain", to)?;
        }
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;

    fn make_valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            client_authentication: ClientAuthConfig {
                allowed_keys: vec!["sk-client-key".to_string()],
            },
            retry: RetryConfig::default(),
            routing: RoutingConfig::default(),
            providers: vec![
                ProviderConfig {
                    name: "kiro".to_string(),
                    provider: "claude-kiro-oauth".to_string(),
                    credentials: vec![CredentialConfig {
                        id: "k1".to_string(),
                        file: Some("/tmp/k1.json".to_string()),
                        api_key: None,
                    }],
                    base_url: None,
                    region: None,
                    models: vec![],
                },
                ProviderConfig {
                    name: "openai".to_string(),
                    provider: "openai-custom".to_string(),
                    credentials: vec![CredentialConfig {
                        id: "o1".to_string(),
                        file: None,
                        api_key: Some("sk-up".to_string()),
                    }],
                    base_url: Some("https://api.openai.com/v1".to_string()),
                    region: None,
                    models: vec!["gpt-4o".to_string()],
                },
            ],
            features: FeaturesConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = make_valid_config();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_empty_allowed_keys() {
        let mut config = make_valid_config();
        config.client_authentication.allowed_keys = vec![];
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_zero_max_attempts() {
        let mut config = make_valid_config();
        config.retry.max_attempts = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_unknown_provider() {
        let mut config = make_valid_config();
        config.providers[0].provider = "bedrock".to_string();
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("unknown provider"));
    }

    #[test]
    fn test_credential_needs_file_or_key() {
        let mut config = make_valid_config();
        config.providers[0].credentials[0].file = None;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_openai_compatible_needs_base_url() {
        let mut config = make_valid_config();
        config.providers[1].base_url = None;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_credential_id() {
        let mut config = make_valid_config();
        config.providers[1].credentials[0].id = "k1".to_string();
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("Duplicate credential id"));
    }

    #[test]
    fn test_default_provider_must_be_configured() {
        let mut config = make_valid_config();
        config.providers.remove(0);
        assert!(validate_config(&config).is_err());
        config.routing.default_provider = "nope".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_fallback_entry() {
        let mut config = make_valid_config();
        config
            .routing
            .fallback_chain
            .insert("claude-kiro-oauth".to_string(), vec!["bogus".to_string()]);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = make_valid_config();
        config.features.log_level = "TRACEY".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_pool_max_idle_per_host() {
        let mut config = make_valid_config();
        config.server.http_pool_max_idle_per_host = 0;
        assert!(validate_config(&config).is_err());
    }
}
