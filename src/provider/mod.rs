//! Backend adapters and the credential pool they are drawn from.
//!
//! An adapter owns one credential and speaks one backend protocol. It retries
//! transient failures on that credential itself, reports credential failures
//! to the pool, and hands every other decision to the orchestrator through
//! the error it returns.

pub mod classify;
pub mod credentials;
pub mod event_stream;
pub mod kiro;
pub mod openai_compat;
pub mod pool;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::protocol::canonical::{
    CanonicalRequest, CanonicalResponse, CanonicalStreamEvent, ModelInfo, ProviderKind,
};

pub use pool::InMemoryPool;

/// Canonical events produced lazily by a streaming generation.
pub type EventStream = BoxStream<'static, Result<CanonicalStreamEvent, RelayError>>;

/// Everything an adapter needs to know about the attempt it serves.
#[derive(Clone)]
pub struct AttemptContext {
    pub request_id: String,
    pub provider: ProviderKind,
    pub credential_id: String,
    pub pool: Arc<dyn ProviderPool>,
    /// Fires when the client goes away; every suspension point watches it.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for AttemptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptContext")
            .field("request_id", &self.request_id)
            .field("provider", &self.provider)
            .field("credential_id", &self.credential_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_kind(&self) -> ProviderKind;

    fn credential_id(&self) -> &str;

    /// Load credentials and make sure they are usable.
    ///
    /// # Errors
    ///
    /// [`RelayError::NoCredentials`] when nothing usable could be loaded.
    async fn initialize(&self) -> Result<(), RelayError>;

    /// Refresh the credential after the pool flagged it.
    ///
    /// # Errors
    ///
    /// [`RelayError::Auth`] or transport errors when the refresh failed.
    async fn refresh_credential(&self) -> Result<(), RelayError>;

    /// # Errors
    ///
    /// Classified backend failures, see [`RelayError::failure_class`].
    async fn generate_content(
        &self,
        model: &str,
        request: &CanonicalRequest,
        ctx: &AttemptContext,
    ) -> Result<CanonicalResponse, RelayError>;

    /// Start a streaming generation. Errors before the first event come back
    /// here; errors after it come through the stream.
    ///
    /// # Errors
    ///
    /// Classified backend failures, see [`RelayError::failure_class`].
    async fn generate_content_stream(
        &self,
        model: &str,
        request: &CanonicalRequest,
        ctx: &AttemptContext,
    ) -> Result<EventStream, RelayError>;

    /// # Errors
    ///
    /// Transport or upstream failures while fetching the directory.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, RelayError>;
}

/// One selected adapter, owned by the orchestrator for a single attempt.
#[derive(Clone)]
pub struct AdapterHandle {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub credential_id: String,
    pub provider: ProviderKind,
    pub display_name: String,
    pub is_fallback: bool,
}

impl std::fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterHandle")
            .field("credential_id", &self.credential_id)
            .field("provider", &self.provider)
            .field("display_name", &self.display_name)
            .field("is_fallback", &self.is_fallback)
            .finish_non_exhaustive()
    }
}

/// Credential health tracking shared by every request.
///
/// Implementations serialize their own updates and never block on I/O.
pub trait ProviderPool: Send + Sync {
    /// Pick a healthy credential for `provider`, walking the fallback chain
    /// when it has none.
    ///
    /// # Errors
    ///
    /// [`RelayError::NoCredentials`] when no provider in the chain has one.
    fn select_adapter(&self, provider: ProviderKind, model: &str) -> Result<AdapterHandle, RelayError>;

    fn mark_healthy(&self, provider: ProviderKind, credential_id: &str);

    fn mark_unhealthy(&self, provider: ProviderKind, credential_id: &str, reason: &str);

    fn mark_needs_refresh(&self, provider: ProviderKind, credential_id: &str);

    fn mark_unhealthy_with_recovery(
        &self,
        provider: ProviderKind,
        credential_id: &str,
        reason: &str,
        recover_at: DateTime<Utc>,
    );

    /// Current id of a credential whose identity may have changed on refresh.
    fn refresh_credential_identity(&self, provider: ProviderKind, credential_id: &str) -> Option<String>;
}
