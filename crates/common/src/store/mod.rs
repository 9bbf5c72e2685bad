//! Tenant-scoped persistence
//!
//! Every operation takes the owning `user_id` first. A row that belongs to a
//! different user is reported exactly like a missing row. Two realisations
//! exist: the in-memory stores in [`memory`] and the SeaORM-backed
//! [`crate::db::Repository`].

pub mod memory;

use crate::errors::{AppError, Result};
use crate::models::{
    ApiKey, CreateApiKey, CreateDatasource, CreateQuery, Datasource, NewApiKey, Query,
    UpdateDatasource, UpdateQuery,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::{InMemoryApiKeyStore, InMemoryDatasourceStore, InMemoryQueryStore};

/// Default page size for list operations
pub const DEFAULT_PER_PAGE: i64 = 25;

/// Validated offset pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    page: u64,
    per: u64,
}

impl Page {
    /// `page` and `per` are 1-based and must both be at least 1
    pub fn new(page: i64, per: i64) -> Result<Self> {
        if page < 1 || per < 1 {
            return Err(AppError::InvalidPagination { page, per });
        }
        Ok(Self {
            page: page as u64,
            per: per as u64,
        })
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.per)
    }

    pub fn limit(&self) -> u64 {
        self.per
    }

    /// Slice an already ordered collection
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let offset = usize::try_from(self.offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(self.limit()).unwrap_or(usize::MAX);
        items.into_iter().skip(offset).take(limit).collect()
    }
}

#[async_trait]
pub trait DatasourceStore: Send + Sync {
    async fn create(&self, user_id: &str, input: CreateDatasource) -> Result<Datasource>;

    async fn get(&self, user_id: &str, id: &str) -> Result<Datasource>;

    /// Ordered by `created_at`, then `id`
    async fn list(&self, user_id: &str, page: i64, per: i64) -> Result<Vec<Datasource>>;

    async fn update(&self, user_id: &str, id: &str, input: UpdateDatasource) -> Result<Datasource>;

    /// Returns the entity as it was before deletion
    async fn delete(&self, user_id: &str, id: &str) -> Result<Datasource>;
}

#[async_trait]
pub trait QueryStore: Send + Sync {
    /// `created_at`, `updated_at` and `last_refresh` are all stamped with the same instant
    async fn create(&self, user_id: &str, input: CreateQuery) -> Result<Query>;

    async fn get(&self, user_id: &str, id: &str) -> Result<Query>;

    /// Ordered by `created_at`, then `id`
    async fn list(&self, user_id: &str, page: i64, per: i64) -> Result<Vec<Query>>;

    async fn update(&self, user_id: &str, id: &str, input: UpdateQuery) -> Result<Query>;

    async fn delete(&self, user_id: &str, id: &str) -> Result<Query>;
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Generates the secret; the returned plaintext is never retrievable again
    async fn create(&self, user_id: &str, input: CreateApiKey) -> Result<NewApiKey>;

    async fn get(&self, user_id: &str, id: &str) -> Result<ApiKey>;

    async fn list(&self, user_id: &str, page: i64, per: i64) -> Result<Vec<ApiKey>>;

    async fn delete(&self, user_id: &str, id: &str) -> Result<ApiKey>;

    /// Resolve a plaintext key to its metadata
    async fn get_by_key(&self, key: &str) -> Result<ApiKey>;

    /// Record a successful authentication
    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<()>;
}
