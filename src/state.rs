mod request_id;

use std::sync::Arc;

use crate::auth::{authenticate, build_allowed_key_set, AllowedClientKeys};
use crate::config::AppConfig;
use crate::error::RelayError;
use crate::orchestrator::Orchestrator;
use crate::protocol::canonical::IngressApi;
use crate::protocol::converter::WireConverter;
use crate::provider::InMemoryPool;
use crate::routing::ModelRouter;

use request_id::RequestIdGenerator;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub pool: Arc<InMemoryPool>,
    pub orchestrator: Arc<Orchestrator>,
    pub converter: WireConverter,
    pub router: ModelRouter,
    allowed_client_keys: AllowedClientKeys,
    request_ids: RequestIdGenerator,
}

impl AppState {
    /// # Errors
    ///
    /// [`RelayError::Config`] when routing cannot be built from `config`.
    pub fn new(config: AppConfig, pool: Arc<InMemoryPool>) -> Result<Self, RelayError> {
        let router = ModelRouter::new(&config)?;
        let orchestrator = Arc::new(Orchestrator::new(pool.clone(), &config.retry));
        let allowed_client_keys = build_allowed_key_set(&config.client_authentication.allowed_keys);
        Ok(Self {
            config,
            pool,
            orchestrator,
            converter: WireConverter,
            router,
            allowed_client_keys,
            request_ids: RequestIdGenerator::new(),
        })
    }

    /// # Errors
    ///
    /// [`RelayError::Auth`] for missing or unknown client keys.
    pub fn authenticate(
        &self,
        ingress: IngressApi,
        headers: &http::HeaderMap,
        query: Option<&str>,
    ) -> Result<(), RelayError> {
        authenticate(ingress, headers, query, &self.allowed_client_keys)
    }

    #[must_use]
    pub fn next_request_id(&self, ingress: IngressApi) -> String {
        self.request_ids.next_id(ingress)
    }
}
