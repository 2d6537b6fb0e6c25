use std::sync::Arc;

use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};

use crate::error::into_axum_response;
use crate::protocol::canonical::IngressApi;
use crate::protocol::converter::ProtocolConverter;
use crate::state::AppState;

/// Model directory in the shape `ingress` clients expect.
pub async fn handler(
    state: Arc<AppState>,
    ingress: IngressApi,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Response {
    if let Err(err) = state.authenticate(ingress, headers, query) {
        return into_axum_response(&err, ingress);
    }
    let models = state.pool.list_models().await;
    Json(state.converter.encode_model_list(ingress, &models)).into_response()
}
