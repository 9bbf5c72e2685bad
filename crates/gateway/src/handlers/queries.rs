//! Query management and result handlers

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use validator::Validate;

use super::{ApiJson, Pagination};
use crate::AppState;
use bissy_common::{
    auth::AuthContext,
    errors::Result,
    models::{CreateQuery, Query, UpdateQuery},
};

/// Content type of query results
pub const CSV_CONTENT_TYPE: &str = "text/csv; charset=utf-8";

/// A referenced datasource must belong to the caller
async fn ensure_datasource(state: &AppState, user_id: &str, datasource_id: Option<&str>) -> Result<()> {
    if let Some(id) = datasource_id {
        state.datasources.get(user_id, id).await?;
    }
    Ok(())
}

/// Create a cached query
pub async fn create_query(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiJson(request): ApiJson<CreateQuery>,
) -> Result<(StatusCode, Json<Query>)> {
    request.validate()?;
    request.check_lifetime()?;
    ensure_datasource(&state, &auth.user_id, request.datasource_id.as_deref()).await?;

    let query = state.queries.create(&auth.user_id, request).await?;

    tracing::info!(
        query_id = %query.id,
        user_id = %auth.user_id,
        lifetime = %query.lifetime,
        "Query created"
    );

    Ok((StatusCode::CREATED, Json(query)))
}

/// List queries owned by the caller
pub async fn list_queries(
    State(state): State<AppState>,
    auth: AuthContext,
    paging: Pagination,
) -> Result<Json<Vec<Query>>> {
    let queries = state
        .queries
        .list(&auth.user_id, paging.page, paging.per)
        .await?;
    Ok(Json(queries))
}

/// Get a query by ID
pub async fn get_query(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<Query>> {
    Ok(Json(state.queries.get(&auth.user_id, &id).await?))
}

/// Partially update a query.
///
/// Changing the SQL does not invalidate the cached result on its own; send
/// `lastRefresh` as well to force the next read to execute.
pub async fn update_query(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<UpdateQuery>,
) -> Result<Json<Query>> {
    request.validate()?;
    request.check_lifetime()?;
    ensure_datasource(&state, &auth.user_id, request.datasource_id.as_deref()).await?;

    let query = state.queries.update(&auth.user_id, &id, request).await?;
    Ok(Json(query))
}

/// Delete a query and drop its cached result
pub async fn delete_query(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<Query>> {
    let query = state.queries.delete(&auth.user_id, &id).await?;
    state.results.forget(&query.id).await;

    tracing::info!(query_id = %id, user_id = %auth.user_id, "Query deleted");

    Ok(Json(query))
}

/// Latest CSV result, served from cache while fresh
pub async fn get_result(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let artifact = state.results.result(&auth.user_id, &id).await?;
    Ok(([(header::CONTENT_TYPE, CSV_CONTENT_TYPE)], artifact))
}
