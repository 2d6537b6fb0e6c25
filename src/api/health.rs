use std::sync::Arc;

use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status, config summary and per-credential health.
pub fn health_handler(state: &Arc<AppState>) -> Json<Value> {
    let config = &state.config;
    let credentials = state.pool.snapshot();
    let healthy = credentials.iter().filter(|c| c.healthy && !c.needs_refresh).count();
    Json(json!({
        "status": "protorelay is running",
        "config": {
            "providers_count": config.providers.len(),
            "client_keys_count": config.client_authentication.allowed_keys.len(),
            "default_provider": config.routing.default_provider,
            "features": {
                "log_level": config.features.log_level,
                "context_budget_tokens": config.features.context_budget_tokens,
            }
        },
        "credentials": {
            "total": credentials.len(),
            "healthy": healthy,
            "entries": credentials,
        }
    }))
}
