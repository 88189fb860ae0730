//! `/idMapping/*` handlers.
//!
//! Ids travel as query parameters; lookups answer with a plain-text body
//! that is empty when the id is unknown.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use idmap_core::{Association, Direction};
use serde::Deserialize;
use tracing::warn;

use super::AppState;
use crate::engine::EngineStats;
use crate::storage::StoreError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromIdQuery {
    pub from_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToIdQuery {
    pub to_id: String,
}

/// Body of `/batchMapping`.
#[derive(Debug, Deserialize)]
pub struct BatchMapping {
    pub ids: Vec<Association>,
}

/// Storage failure surfaced to the caller.
#[derive(Debug)]
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::MissingTable(_) | StoreError::Backend(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        warn!(error = %self.0, "lookup failed");
        (status, self.0.to_string()).into_response()
    }
}

pub async fn mapping_handler(
    State(state): State<AppState>,
    Json(association): Json<Association>,
) -> Json<bool> {
    state.service.insert(&association);
    Json(true)
}

pub async fn batch_mapping_handler(
    State(state): State<AppState>,
    Json(batch): Json<BatchMapping>,
) -> Json<bool> {
    state.service.insert_batch(&batch.ids);
    Json(true)
}

async fn resolve(state: &AppState, direction: Direction, id: &str) -> Result<String, ApiError> {
    let found = state.service.resolve(direction, id).await?;
    Ok(found.map(|(hit, _)| hit).unwrap_or_default())
}

pub async fn get_to_id_handler(
    State(state): State<AppState>,
    Query(query): Query<FromIdQuery>,
) -> Result<String, ApiError> {
    resolve(&state, Direction::Forward, &query.from_id).await
}

pub async fn get_from_id_handler(
    State(state): State<AppState>,
    Query(query): Query<ToIdQuery>,
) -> Result<String, ApiError> {
    resolve(&state, Direction::Reverse, &query.to_id).await
}

pub async fn get_to_id_from_mem_handler(
    State(state): State<AppState>,
    Query(query): Query<FromIdQuery>,
) -> String {
    state
        .service
        .lookup_from_mem(Direction::Forward, &query.from_id)
        .unwrap_or_default()
}

pub async fn get_from_id_from_mem_handler(
    State(state): State<AppState>,
    Query(query): Query<ToIdQuery>,
) -> String {
    state
        .service
        .lookup_from_mem(Direction::Reverse, &query.to_id)
        .unwrap_or_default()
}

pub async fn delete_from_id_handler(
    State(state): State<AppState>,
    Query(query): Query<FromIdQuery>,
) -> Json<bool> {
    state.service.delete(Direction::Forward, &query.from_id);
    Json(true)
}

pub async fn delete_to_id_handler(
    State(state): State<AppState>,
    Query(query): Query<ToIdQuery>,
) -> Json<bool> {
    state.service.delete(Direction::Reverse, &query.to_id);
    Json(true)
}

pub async fn mem_size_handler(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.service.stats())
}
