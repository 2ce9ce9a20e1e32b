//! # API Handlers
//!
//! Axum handlers for the data query endpoint and its companions.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use oq_core::Filter;
use tracing::Instrument;

use crate::pipeline::{self, QueryError};
use crate::store::StoreError;
use crate::AppState;

fn session_token<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// =============================================================================
// Query
// =============================================================================

pub async fn query_data(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = session_token(&headers, &state.config.server.token_header);
    let span = tracing::info_span!("query", request_id = %uuid::Uuid::new_v4());
    match pipeline::run(&state, token, &body).instrument(span).await {
        Ok(outcome) => outcome.into_response(),
        Err(e) => e.into_response(),
    }
}

// =============================================================================
// Status
// =============================================================================

pub async fn status(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(e) => {
            tracing::error!("Store ping failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "store unavailable")
        }
    }
}

// =============================================================================
// Last Entry
// =============================================================================

pub async fn last_entry(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, QueryError> {
    last_entry_for(&state, &headers, &user_id, None).await
}

pub async fn last_entry_device(
    State(state): State<Arc<AppState>>,
    Path((user_id, device_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, QueryError> {
    last_entry_for(&state, &headers, &user_id, Some(&device_id)).await
}

async fn last_entry_for(
    state: &AppState,
    headers: &HeaderMap,
    user_id: &str,
    device_id: Option<&str>,
) -> Result<Response, QueryError> {
    let token = session_token(headers, &state.config.server.token_header);
    let caller = pipeline::authenticate(state, token).await?;
    let subject = pipeline::resolve_subject(state, &caller, user_id).await?;

    let mut filter = Filter::base(subject.storage_key, state.gate());
    if let Some(device) = device_id {
        filter = filter.with_equal("deviceId", device);
    }

    match state.store.last_entry_time(&filter).await {
        Ok(time) => Ok((StatusCode::OK, time).into_response()),
        Err(StoreError::NotFound) => Ok(StatusCode::OK.into_response()),
        Err(e) => {
            tracing::error!("Last entry lookup for {} failed: {}", user_id, e);
            Err(QueryError::Storage)
        }
    }
}
