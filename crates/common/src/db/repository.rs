//! Repository pattern for database operations
//!
//! Implements the tenant-scoped store traits over SeaORM. Every lookup filters
//! on `user_id`, so rows owned by someone else read as missing.

use crate::auth::{generate_api_key, hash_api_key};
use crate::clock::{Clock, IdGenerator};
use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use crate::models::{
    ApiKey, CreateApiKey, CreateDatasource, CreateQuery, Datasource, NewApiKey, Query,
    UpdateDatasource, UpdateQuery,
};
use crate::store::{ApiKeyStore, DatasourceStore, Page, QueryStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use std::sync::Arc;

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { pool, clock, ids }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Scoped lookups
    // ========================================================================

    async fn find_datasource(
        &self,
        conn: &DatabaseConnection,
        user_id: &str,
        id: &str,
    ) -> Result<DatasourceRow> {
        DatasourceEntity::find_by_id(id.to_string())
            .filter(DatasourceColumn::UserId.eq(user_id))
            .one(conn)
            .await?
            .ok_or_else(|| AppError::not_found("datasource", id))
    }

    async fn find_query(&self, conn: &DatabaseConnection, user_id: &str, id: &str) -> Result<QueryRow> {
        QueryEntity::find_by_id(id.to_string())
            .filter(QueryColumn::UserId.eq(user_id))
            .one(conn)
            .await?
            .ok_or_else(|| AppError::not_found("query", id))
    }

    async fn find_api_key(&self, conn: &DatabaseConnection, user_id: &str, id: &str) -> Result<ApiKeyRow> {
        ApiKeyEntity::find_by_id(id.to_string())
            .filter(ApiKeyColumn::UserId.eq(user_id))
            .one(conn)
            .await?
            .ok_or_else(|| AppError::not_found("api key", id))
    }
}

// ============================================================================
// Datasource Operations
// ============================================================================

#[async_trait]
impl DatasourceStore for Repository {
    async fn create(&self, user_id: &str, input: CreateDatasource) -> Result<Datasource> {
        let now = self.clock.now().fixed_offset();

        let row = DatasourceActiveModel {
            id: Set(self.ids.generate()),
            user_id: Set(user_id.to_string()),
            name: Set(input.name),
            kind: Set(input.kind.as_str().to_string()),
            options: Set(input.options),
            created_at: Set(now),
            updated_at: Set(now),
        };

        row.insert(self.write_conn()).await?.try_into()
    }

    async fn get(&self, user_id: &str, id: &str) -> Result<Datasource> {
        self.find_datasource(self.read_conn(), user_id, id).await?.try_into()
    }

    async fn list(&self, user_id: &str, page: i64, per: i64) -> Result<Vec<Datasource>> {
        let page = Page::new(page, per)?;

        DatasourceEntity::find()
            .filter(DatasourceColumn::UserId.eq(user_id))
            .order_by_asc(DatasourceColumn::CreatedAt)
            .order_by_asc(DatasourceColumn::Id)
            .offset(page.offset())
            .limit(page.limit())
            .all(self.read_conn())
            .await?
            .into_iter()
            .map(Datasource::try_from)
            .collect()
    }

    async fn update(&self, user_id: &str, id: &str, input: UpdateDatasource) -> Result<Datasource> {
        let mut row: DatasourceActiveModel =
            self.find_datasource(self.write_conn(), user_id, id).await?.into();

        if let Some(name) = input.name {
            row.name = Set(name);
        }
        if let Some(kind) = input.kind {
            row.kind = Set(kind.as_str().to_string());
        }
        if let Some(options) = input.options {
            row.options = Set(options);
        }
        row.updated_at = Set(self.clock.now().fixed_offset());

        row.update(self.write_conn()).await?.try_into()
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<Datasource> {
        let row = self.find_datasource(self.write_conn(), user_id, id).await?;
        DatasourceEntity::delete_by_id(row.id.clone())
            .exec(self.write_conn())
            .await?;
        row.try_into()
    }
}

// ============================================================================
// Query Operations
// ============================================================================

#[async_trait]
impl QueryStore for Repository {
    async fn create(&self, user_id: &str, input: CreateQuery) -> Result<Query> {
        input.check_lifetime()?;
        let now = self.clock.now().fixed_offset();

        let row = QueryActiveModel {
            id: Set(self.ids.generate()),
            user_id: Set(user_id.to_string()),
            sql: Set(input.sql),
            datasource_id: Set(input.datasource_id),
            lifetime: Set(input.lifetime.as_nanos()),
            created_at: Set(now),
            updated_at: Set(now),
            last_refresh: Set(now),
        };

        Ok(row.insert(self.write_conn()).await?.into())
    }

    async fn get(&self, user_id: &str, id: &str) -> Result<Query> {
        Ok(self.find_query(self.read_conn(), user_id, id).await?.into())
    }

    async fn list(&self, user_id: &str, page: i64, per: i64) -> Result<Vec<Query>> {
        let page = Page::new(page, per)?;

        let rows = QueryEntity::find()
            .filter(QueryColumn::UserId.eq(user_id))
            .order_by_asc(QueryColumn::CreatedAt)
            .order_by_asc(QueryColumn::Id)
            .offset(page.offset())
            .limit(page.limit())
            .all(self.read_conn())
            .await?;

        Ok(rows.into_iter().map(Query::from).collect())
    }

    async fn update(&self, user_id: &str, id: &str, input: UpdateQuery) -> Result<Query> {
        input.check_lifetime()?;
        let now = self.clock.now();
        input.check_last_refresh(now)?;

        let mut row: QueryActiveModel = self.find_query(self.write_conn(), user_id, id).await?.into();

        if let Some(sql) = input.sql {
            row.sql = Set(sql);
        }
        if let Some(lifetime) = input.lifetime {
            row.lifetime = Set(lifetime.as_nanos());
        }
        if let Some(datasource_id) = input.datasource_id {
            row.datasource_id = Set(Some(datasource_id));
        }
        if let Some(last_refresh) = input.last_refresh {
            row.last_refresh = Set(last_refresh.fixed_offset());
        }
        row.updated_at = Set(now.fixed_offset());

        Ok(row.update(self.write_conn()).await?.into())
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<Query> {
        let row = self.find_query(self.write_conn(), user_id, id).await?;
        QueryEntity::delete_by_id(row.id.clone())
            .exec(self.write_conn())
            .await?;
        Ok(row.into())
    }
}

// ============================================================================
// API Key Operations
// ============================================================================

#[async_trait]
impl ApiKeyStore for Repository {
    async fn create(&self, user_id: &str, input: CreateApiKey) -> Result<NewApiKey> {
        let key = generate_api_key();

        let row = ApiKeyActiveModel {
            id: Set(self.ids.generate()),
            user_id: Set(user_id.to_string()),
            name: Set(input.name),
            key_hash: Set(hash_api_key(&key)),
            last_used: Set(None),
            created_at: Set(self.clock.now().fixed_offset()),
        };

        let api_key: ApiKey = row.insert(self.write_conn()).await?.into();
        Ok(NewApiKey { api_key, key })
    }

    async fn get(&self, user_id: &str, id: &str) -> Result<ApiKey> {
        Ok(self.find_api_key(self.read_conn(), user_id, id).await?.into())
    }

    async fn list(&self, user_id: &str, page: i64, per: i64) -> Result<Vec<ApiKey>> {
        let page = Page::new(page, per)?;

        let rows = ApiKeyEntity::find()
            .filter(ApiKeyColumn::UserId.eq(user_id))
            .order_by_asc(ApiKeyColumn::CreatedAt)
            .order_by_asc(ApiKeyColumn::Id)
            .offset(page.offset())
            .limit(page.limit())
            .all(self.read_conn())
            .await?;

        Ok(rows.into_iter().map(ApiKey::from).collect())
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<ApiKey> {
        let row = self.find_api_key(self.write_conn(), user_id, id).await?;
        ApiKeyEntity::delete_by_id(row.id.clone())
            .exec(self.write_conn())
            .await?;
        Ok(row.into())
    }

    /// Equality lookup on the digest; the plaintext never reaches the database
    async fn get_by_key(&self, key: &str) -> Result<ApiKey> {
        // Primary, so a key deleted a moment ago cannot linger on a lagging replica
        ApiKeyEntity::find()
            .filter(ApiKeyColumn::KeyHash.eq(hash_api_key(key)))
            .one(self.write_conn())
            .await?
            .map(ApiKey::from)
            .ok_or_else(|| AppError::not_found("api key", "<redacted>"))
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = ApiKeyEntity::update_many()
            .col_expr(ApiKeyColumn::LastUsed, Expr::value(Some(at.fixed_offset())))
            .filter(ApiKeyColumn::Id.eq(id))
            .exec(self.write_conn())
            .await?;

        if result.rows_affected == 0 {
            return Err(AppError::not_found("api key", id));
        }
        Ok(())
    }
}
