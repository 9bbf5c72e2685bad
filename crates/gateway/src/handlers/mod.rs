//! API handlers module

pub mod apikeys;
pub mod datasources;
pub mod health;
pub mod queries;

use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Query, Request},
    http::request::Parts,
    Json,
};
use bissy_common::{errors::AppError, store::DEFAULT_PER_PAGE};
use serde::Deserialize;

/// JSON body extractor whose rejections render as `InvalidBody`
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(request, state)
            .await
            .map_err(|rejection| AppError::InvalidBody {
                message: rejection.body_text(),
            })?;
        Ok(ApiJson(value))
    }
}

#[derive(Debug, Deserialize)]
struct RawPagination {
    page: Option<i64>,
    per: Option<i64>,
}

/// `?page=&per=` with defaults 1 and 25; range checks happen in the stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: i64,
    pub per: i64,
}

impl<S> FromRequestParts<S> for Pagination
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(raw) = Query::<RawPagination>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| AppError::Validation {
                message: rejection.body_text(),
                field: None,
            })?;

        Ok(Pagination {
            page: raw.page.unwrap_or(1),
            per: raw.per.unwrap_or(DEFAULT_PER_PAGE),
        })
    }
}
