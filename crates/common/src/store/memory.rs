//! Process-local stores for single-node deployments and tests
//!
//! Each store is a map behind a read-write lock: reads share the lock, writes
//! take it exclusively.

use super::{ApiKeyStore, DatasourceStore, Page, QueryStore};
use crate::auth::{generate_api_key, hash_api_key};
use crate::clock::{Clock, IdGenerator};
use crate::errors::{AppError, Result};
use crate::models::{
    ApiKey, CreateApiKey, CreateDatasource, CreateQuery, Datasource, NewApiKey, Query,
    UpdateDatasource, UpdateQuery,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Sort by creation time then id, and cut the requested page
fn ordered_page<T>(mut items: Vec<T>, page: Page, key: impl Fn(&T) -> (DateTime<Utc>, String)) -> Vec<T> {
    items.sort_by_cached_key(key);
    page.apply(items)
}

pub struct InMemoryDatasourceStore {
    rows: RwLock<HashMap<String, Datasource>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryDatasourceStore {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            clock,
            ids,
        }
    }
}

#[async_trait]
impl DatasourceStore for InMemoryDatasourceStore {
    async fn create(&self, user_id: &str, input: CreateDatasource) -> Result<Datasource> {
        let now = self.clock.now();
        let datasource = Datasource {
            id: self.ids.generate(),
            user_id: user_id.to_string(),
            name: input.name,
            kind: input.kind,
            options: input.options,
            created_at: now,
            updated_at: now,
        };

        self.rows
            .write()
            .await
            .insert(datasource.id.clone(), datasource.clone());
        Ok(datasource)
    }

    async fn get(&self, user_id: &str, id: &str) -> Result<Datasource> {
        self.rows
            .read()
            .await
            .get(id)
            .filter(|d| d.user_id == user_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("datasource", id))
    }

    async fn list(&self, user_id: &str, page: i64, per: i64) -> Result<Vec<Datasource>> {
        let page = Page::new(page, per)?;
        let owned: Vec<Datasource> = self
            .rows
            .read()
            .await
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        Ok(ordered_page(owned, page, |d| (d.created_at, d.id.clone())))
    }

    async fn update(&self, user_id: &str, id: &str, input: UpdateDatasource) -> Result<Datasource> {
        let now = self.clock.now();
        let mut rows = self.rows.write().await;
        let datasource = rows
            .get_mut(id)
            .filter(|d| d.user_id == user_id)
            .ok_or_else(|| AppError::not_found("datasource", id))?;

        datasource.apply(input, now);
        Ok(datasource.clone())
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<Datasource> {
        let mut rows = self.rows.write().await;
        match rows.get(id) {
            Some(d) if d.user_id == user_id => {}
            _ => return Err(AppError::not_found("datasource", id)),
        }
        rows.remove(id)
            .ok_or_else(|| AppError::not_found("datasource", id))
    }
}

pub struct InMemoryQueryStore {
    rows: RwLock<HashMap<String, Query>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryQueryStore {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            clock,
            ids,
        }
    }
}

#[async_trait]
impl QueryStore for InMemoryQueryStore {
    async fn create(&self, user_id: &str, input: CreateQuery) -> Result<Query> {
        input.check_lifetime()?;
        let now = self.clock.now();
        let query = Query {
            id: self.ids.generate(),
            user_id: user_id.to_string(),
            sql: input.sql,
            datasource_id: input.datasource_id,
            lifetime: input.lifetime,
            created_at: now,
            updated_at: now,
            last_refresh: now,
        };

        self.rows.write().await.insert(query.id.clone(), query.clone());
        Ok(query)
    }

    async fn get(&self, user_id: &str, id: &str) -> Result<Query> {
        self.rows
            .read()
            .await
            .get(id)
            .filter(|q| q.user_id == user_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("query", id))
    }

    async fn list(&self, user_id: &str, page: i64, per: i64) -> Result<Vec<Query>> {
        let page = Page::new(page, per)?;
        let owned: Vec<Query> = self
            .rows
            .read()
            .await
            .values()
            .filter(|q| q.user_id == user_id)
            .cloned()
            .collect();
        Ok(ordered_page(owned, page, |q| (q.created_at, q.id.clone())))
    }

    async fn update(&self, user_id: &str, id: &str, input: UpdateQuery) -> Result<Query> {
        input.check_lifetime()?;
        let now = self.clock.now();
        input.check_last_refresh(now)?;
        let mut rows = self.rows.write().await;
        let query = rows
            .get_mut(id)
            .filter(|q| q.user_id == user_id)
            .ok_or_else(|| AppError::not_found("query", id))?;

        query.apply(input, now);
        Ok(query.clone())
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<Query> {
        let mut rows = self.rows.write().await;
        match rows.get(id) {
            Some(q) if q.user_id == user_id => {}
            _ => return Err(AppError::not_found("query", id)),
        }
        rows.remove(id).ok_or_else(|| AppError::not_found("query", id))
    }
}

#[derive(Default)]
struct KeyTable {
    by_id: HashMap<String, (ApiKey, String)>,
    /// key digest -> key id
    by_hash: HashMap<String, String>,
}

pub struct InMemoryApiKeyStore {
    table: RwLock<KeyTable>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryApiKeyStore {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            table: RwLock::new(KeyTable::default()),
            clock,
            ids,
        }
    }
}

#[async_trait]
impl ApiKeyStore for InMemoryApiKeyStore {
    async fn create(&self, user_id: &str, input: CreateApiKey) -> Result<NewApiKey> {
        let key = generate_api_key();
        let digest = hash_api_key(&key);
        let api_key = ApiKey {
            id: self.ids.generate(),
            user_id: user_id.to_string(),
            name: input.name,
            last_used: None,
            created_at: self.clock.now(),
        };

        let mut table = self.table.write().await;
        if table.by_hash.contains_key(&digest) {
            return Err(AppError::Internal {
                message: "API key collision".to_string(),
            });
        }
        table.by_hash.insert(digest.clone(), api_key.id.clone());
        table
            .by_id
            .insert(api_key.id.clone(), (api_key.clone(), digest));

        Ok(NewApiKey { api_key, key })
    }

    async fn get(&self, user_id: &str, id: &str) -> Result<ApiKey> {
        self.table
            .read()
            .await
            .by_id
            .get(id)
            .map(|(key, _)| key)
            .filter(|k| k.user_id == user_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("api key", id))
    }

    async fn list(&self, user_id: &str, page: i64, per: i64) -> Result<Vec<ApiKey>> {
        let page = Page::new(page, per)?;
        let owned: Vec<ApiKey> = self
            .table
            .read()
            .await
            .by_id
            .values()
            .map(|(key, _)| key)
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect();
        Ok(ordered_page(owned, page, |k| (k.created_at, k.id.clone())))
    }

    async fn delete(&self, user_id: &str, id: &str) -> Result<ApiKey> {
        let mut table = self.table.write().await;
        match table.by_id.get(id) {
            Some((key, _)) if key.user_id == user_id => {}
            _ => return Err(AppError::not_found("api key", id)),
        }
        let (key, digest) = table
            .by_id
            .remove(id)
            .ok_or_else(|| AppError::not_found("api key", id))?;
        table.by_hash.remove(&digest);
        Ok(key)
    }

    async fn get_by_key(&self, key: &str) -> Result<ApiKey> {
        let digest = hash_api_key(key);
        let table = self.table.read().await;
        table
            .by_hash
            .get(&digest)
            .and_then(|id| table.by_id.get(id))
            .map(|(key, _)| key.clone())
            .ok_or_else(|| AppError::not_found("api key", "<redacted>"))
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut table = self.table.write().await;
        let (key, _) = table
            .by_id
            .get_mut(id)
            .ok_or_else(|| AppError::not_found("api key", id))?;
        key.last_used = Some(at);
        Ok(())
    }
}
