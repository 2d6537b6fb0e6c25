use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::AppConfig;
use crate::error::RelayError;
use crate::protocol::canonical::{ModelInfo, ProviderKind};
use crate::transport::HttpTransport;

use super::kiro::KiroAdapter;
use super::openai_compat::OpenAiCompatAdapter;
use super::{AdapterHandle, ProviderAdapter, ProviderPool};

struct PoolEntry {
    adapter: Arc<dyn ProviderAdapter>,
    provider: ProviderKind,
    credential_id: String,
    display_name: String,
    healthy: bool,
    needs_refresh: bool,
    recover_at: Option<DateTime<Utc>>,
    usage_count: u64,
    error_count: u64,
    last_error: Option<String>,
}

impl PoolEntry {
    /// Selectable now. A passed recovery time puts the entry back in rotation.
    fn available(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(recover_at) = self.recover_at {
            if now < recover_at {
                return false;
            }
            self.recover_at = None;
            self.healthy = true;
        }
        self.healthy && !self.needs_refresh
    }
}

#[derive(Default)]
struct PoolState {
    entries: Vec<PoolEntry>,
    cursors: FxHashMap<ProviderKind, usize>,
}

/// Point-in-time view of one credential, for the health endpoint and logs.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CredentialStatus {
    pub provider: ProviderKind,
    pub credential_id: String,
    pub display_name: String,
    pub healthy: bool,
    pub needs_refresh: bool,
    pub recover_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

/// Process-local pool: round-robin over healthy credentials per provider,
/// with a fallback chain between providers.
pub struct InMemoryPool {
    state: Mutex<PoolState>,
    fallback_chain: FxHashMap<ProviderKind, Vec<ProviderKind>>,
}

impl InMemoryPool {
    #[must_use]
    pub fn new(fallback_chain: FxHashMap<ProviderKind, Vec<ProviderKind>>) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            fallback_chain,
        }
    }

    pub fn add_adapter(&self, adapter: Arc<dyn ProviderAdapter>, display_name: impl Into<String>) {
        let entry = PoolEntry {
            provider: adapter.provider_kind(),
            credential_id: adapter.credential_id().to_owned(),
            adapter,
            display_name: display_name.into(),
            healthy: true,
            needs_refresh: false,
            recover_at: None,
            usage_count: 0,
            error_count: 0,
            last_error: None,
        };
        self.state.lock().entries.push(entry);
    }

    /// Build adapters for every configured credential.
    ///
    /// # Errors
    ///
    /// [`RelayError::Config`] for provider entries the config layer should
    /// have rejected.
    pub fn from_config(config: &AppConfig, transport: &HttpTransport) -> Result<Self, RelayError> {
        let mut chain = FxHashMap::default();
        for (from, to) in &config.routing.fallback_chain {
            let from = ProviderKind::parse(from)
                .ok_or_else(|| RelayError::Config(format!("unknown provider '{from}'")))?;
            let to = to.iter().filter_map(|kind| ProviderKind::parse(kind)).collect();
            chain.insert(from, to);
        }
        let pool = Self::new(chain);
        for entry in &config.providers {
            let kind = ProviderKind::parse(&entry.provider)
                .ok_or_else(|| RelayError::Config(format!("unknown provider '{}'", entry.provider)))?;
            for credential in &entry.credentials {
                let adapter: Arc<dyn ProviderAdapter> = match kind {
                    ProviderKind::Kiro => Arc::new(KiroAdapter::from_config(
                        entry,
                        credential,
                        &config.features,
                        transport.clone(),
                    )?),
                    ProviderKind::OpenAiCompatible => Arc::new(OpenAiCompatAdapter::from_config(
                        entry,
                        credential,
                        transport.clone(),
                    )?),
                };
                pool.add_adapter(adapter, format!("{}/{}", entry.name, credential.id));
            }
        }
        Ok(pool)
    }

    /// Initialize every adapter. A failure takes the credential out of
    /// rotation until the refresh loop brings it back.
    pub async fn initialize_all(&self) {
        let adapters: Vec<_> = self
            .state
            .lock()
            .entries
            .iter()
            .map(|entry| (entry.provider, entry.credential_id.clone(), entry.adapter.clone()))
            .collect();
        for (provider, credential_id, adapter) in adapters {
            if let Err(err) = adapter.initialize().await {
                tracing::warn!(%provider, credential = %credential_id, error = %err, "credential failed to initialize");
                self.update(provider, &credential_id, |entry| {
                    entry.needs_refresh = true;
                    entry.error_count += 1;
                    entry.last_error = Some(err.to_string());
                });
            }
        }
    }

    /// Refresh every credential flagged by `mark_needs_refresh`.
    pub async fn run_refresh_pass(&self) {
        let pending: Vec<_> = self
            .state
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.needs_refresh)
            .map(|entry| (entry.provider, entry.credential_id.clone(), entry.adapter.clone()))
            .collect();
        for (provider, credential_id, adapter) in pending {
            match adapter.refresh_credential().await {
                Ok(()) => {
                    let current = self
                        .refresh_credential_identity(provider, &credential_id)
                        .unwrap_or_else(|| credential_id.clone());
                    tracing::info!(%provider, credential = %current, "credential refreshed");
                    self.mark_healthy(provider, &current);
                }
                Err(err) => {
                    tracing::warn!(%provider, credential = %credential_id, error = %err, "credential refresh failed");
                    self.record_error(provider, &credential_id, &err.to_string());
                }
            }
        }
    }

    /// Periodically run [`Self::run_refresh_pass`] until the runtime shuts down.
    pub fn spawn_refresh_loop(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.run_refresh_pass().await;
            }
        })
    }

    /// Union of every provider's model directory, first provider wins on
    /// duplicate ids.
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        let mut seen = FxHashSet::default();
        let adapters: Vec<_> = self
            .state
            .lock()
            .entries
            .iter()
            .filter(|entry| seen.insert(entry.provider))
            .map(|entry| entry.adapter.clone())
            .collect();
        let mut ids = FxHashSet::default();
        let mut models = Vec::new();
        for adapter in adapters {
            match adapter.list_models().await {
                Ok(list) => models.extend(list.into_iter().filter(|model| ids.insert(model.id.clone()))),
                Err(err) => tracing::warn!(
                    provider = %adapter.provider_kind(),
                    error = %err,
                    "model directory unavailable"
                ),
            }
        }
        models
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<CredentialStatus> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|entry| CredentialStatus {
                provider: entry.provider,
                credential_id: entry.credential_id.clone(),
                display_name: entry.display_name.clone(),
                healthy: entry.healthy,
                needs_refresh: entry.needs_refresh,
                recover_at: entry.recover_at,
                usage_count: entry.usage_count,
                error_count: entry.error_count,
                last_error: entry.last_error.clone(),
            })
            .collect()
    }

    fn update(&self, provider: ProviderKind, credential_id: &str, apply: impl FnOnce(&mut PoolEntry)) {
        let mut state = self.state.lock();
        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|entry| entry.provider == provider && entry.credential_id == credential_id)
        {
            apply(entry);
        }
    }

    fn record_error(&self, provider: ProviderKind, credential_id: &str, reason: &str) {
        self.update(provider, credential_id, |entry| {
            entry.error_count += 1;
            entry.last_error = Some(reason.to_owned());
        });
    }

    fn select_from(state: &mut PoolState, provider: ProviderKind, now: DateTime<Utc>) -> Option<usize> {
        let candidates: Vec<usize> = state
            .entries
            .iter_mut()
            .enumerate()
            .filter(|(_, entry)| entry.provider == provider)
            .filter_map(|(i, entry)| entry.available(now).then_some(i))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let cursor = state.cursors.entry(provider).or_insert(0);
        let picked = candidates[*cursor % candidates.len()];
        *cursor = cursor.wrapping_add(1);
        Some(picked)
    }
}

impl ProviderPool for InMemoryPool {
    fn select_adapter(&self, provider: ProviderKind, model: &str) -> Result<AdapterHandle, RelayError> {
        let now = Utc::now();
        let chain = std::iter::once(provider).chain(
            self.fallback_chain
                .get(&provider)
                .into_iter()
                .flatten()
                .copied(),
        );
        let mut state = self.state.lock();
        for (hop, kind) in chain.enumerate() {
            let Some(index) = Self::select_from(&mut state, kind, now) else {
                continue;
            };
            let entry = &mut state.entries[index];
            entry.usage_count += 1;
            if hop > 0 {
                tracing::info!(from = %provider, to = %kind, model, "no healthy credential, using fallback provider");
            }
            return Ok(AdapterHandle {
                adapter: entry.adapter.clone(),
                credential_id: entry.credential_id.clone(),
                provider: kind,
                display_name: entry.display_name.clone(),
                is_fallback: hop > 0,
            });
        }
        Err(RelayError::NoCredentials(format!(
            "no healthy credential for provider {provider}"
        )))
    }

    fn mark_healthy(&self, provider: ProviderKind, credential_id: &str) {
        self.update(provider, credential_id, |entry| {
            entry.healthy = true;
            entry.needs_refresh = false;
            entry.recover_at = None;
        });
    }

    fn mark_unhealthy(&self, provider: ProviderKind, credential_id: &str, reason: &str) {
        self.update(provider, credential_id, |entry| {
            entry.healthy = false;
            entry.error_count += 1;
            entry.last_error = Some(reason.to_owned());
        });
    }

    fn mark_needs_refresh(&self, provider: ProviderKind, credential_id: &str) {
        self.update(provider, credential_id, |entry| {
            entry.needs_refresh = true;
            entry.error_count += 1;
        });
    }

    fn mark_unhealthy_with_recovery(
        &self,
        provider: ProviderKind,
        credential_id: &str,
        reason: &str,
        recover_at: DateTime<Utc>,
    ) {
        self.update(provider, credential_id, |entry| {
            entry.healthy = false;
            entry.recover_at = Some(recover_at);
            entry.error_count += 1;
            entry.last_error = Some(reason.to_owned());
        });
    }

    fn refresh_credential_identity(&self, provider: ProviderKind, credential_id: &str) -> Option<String> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .iter_mut()
            .find(|entry| entry.provider == provider && entry.credential_id == credential_id)?;
        let current = entry.adapter.credential_id().to_owned();
        entry.credential_id.clone_from(&current);
        Some(current)
    }
}
