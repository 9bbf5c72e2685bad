//! Datasource management handlers

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
    models::{CreateDatasource, Datasource, UpdateDatasource},
};

/// Register a new datasource
pub async fn create_datasource(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiJson(request): ApiJson<CreateDatasource>,
) -> Result<(StatusCode, Json<Datasource>)> {
    request.validate()?;

    let datasource = state.datasources.create(&auth.user_id, request).await?;

    tracing::info!(
        datasource_id = %datasource.id,
        user_id = %auth.user_id,
        driver = %datasource.kind,
        "Datasource created"
    );

    Ok((StatusCode::CREATED, Json(datasource)))
}

/// List datasources owned by the caller
pub async fn list_datasources(
    State(state): State<AppState>,
    auth: AuthContext,
    paging: Pagination,
) -> Result<Json<Vec<Datasource>>> {
    let datasources = state
        .datasources
        .list(&auth.user_id, paging.page, paging.per)
        .await?;
    Ok(Json(datasources))
}

/// Get a datasource by ID
pub async fn get_datasource(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<Datasource>> {
    Ok(Json(state.datasources.get(&auth.user_id, &id).await?))
}

/// Partially update a datasource
pub async fn update_datasource(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<UpdateDatasource>,
) -> Result<Json<Datasource>> {
    request.validate()?;

    let datasource = state.datasources.update(&auth.user_id, &id, request).await?;
    Ok(Json(datasource))
}

/// Delete a datasource; queries pointing at it fail on their next read
pub async fn delete_datasource(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<Datasource>> {
    let datasource = state.datasources.delete(&auth.user_id, &id).await?;

    tracing::info!(datasource_id = %id, user_id = %auth.user_id, "Datasource deleted");

    Ok(Json(datasource))
}
