pub mod dispatch;

use rustc_hash::FxHashMap;

use crate::config::AppConfig;
use crate::error::RelayError;
use crate::protocol::canonical::ProviderKind;

/// Picks the provider type for a requested model.
///
/// Models listed under a provider entry go to that provider; everything else
/// goes to `routing.default_provider`.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    model_index: FxHashMap<String, ProviderKind>,
    default_provider: ProviderKind,
}

impl ModelRouter {
    /// # Errors
    ///
    /// [`RelayError::Config`] for unknown provider strings.
    pub fn new(config: &AppConfig) -> Result<Self, RelayError> {
        let default_provider = ProviderKind::parse(&config.routing.default_provider).ok_or_else(|| {
            RelayError::Config(format!(
                "unknown default provider '{}'",
                config.routing.default_provider
            ))
        })?;
        let mut model_index = FxHashMap::default();
        for entry in &config.providers {
            let kind = ProviderKind::parse(&entry.provider)
                .ok_or_else(|| RelayError::Config(format!("unknown provider '{}'", entry.provider)))?;
            for model in &entry.models {
                model_index.entry(model.clone()).or_insert(kind);
            }
        }
        Ok(Self {
            model_index,
            default_provider,
        })
    }

    #[must_use]
    pub fn provider_for(&self, model: &str) -> ProviderKind {
        self.model_index
            .get(model)
            .copied()
            .unwrap_or(self.default_provider)
    }

    #[must_use]
    pub fn default_provider(&self) -> ProviderKind {
        self.default_provider
    }
}
