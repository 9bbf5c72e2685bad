//! API key handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use super::{ApiJson, Pagination};
use crate::AppState;
use bissy_common::{
    auth::AuthContext,
    errors::Result,
    models::{ApiKey, CreateApiKey, NewApiKey},
};

/// Issue a new API key; the plaintext is only ever returned here
pub async fn create_api_key(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiJson(request): ApiJson<CreateApiKey>,
) -> Result<(StatusCode, Json<NewApiKey>)> {
    request.validate()?;

    let created = state.api_keys.create(&auth.user_id, request).await?;

    tracing::info!(key_id = %created.api_key.id, user_id = %auth.user_id, "API key created");

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    auth: AuthContext,
    paging: Pagination,
) -> Result<Json<Vec<ApiKey>>> {
    let keys = state
        .api_keys
        .list(&auth.user_id, paging.page, paging.per)
        .await?;
    Ok(Json(keys))
}

/// Revoke an API key
pub async fn delete_api_key(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<ApiKey>> {
    let key = state.api_keys.delete(&auth.user_id, &id).await?;

    tracing::info!(key_id = %id, user_id = %auth.user_id, "API key revoked");

    Ok(Json(key))
}
