//! Query executors
//!
//! An executor turns a query into a CSV artifact against one backend.
//! The [`DriverRegistry`] hands out executors and keeps one per
//! `(kind, options)` pair so connection pools are shared between
//! datasources that point at the same backend.

pub mod csv;
pub mod mysql;
pub mod postgres;
pub mod snowflake;

use crate::config::ExecutorConfig;
use crate::errors::Result;
use crate::models::{Datasource, DatasourceKind, Query};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub use self::mysql::MySqlExecutor;
pub use self::postgres::PostgresExecutor;
pub use self::snowflake::SnowflakeExecutor;

/// Runs a query and serializes the full result
#[async_trait]
pub trait Executor: Send + Sync {
    /// Either the whole artifact or an error; never partial rows
    async fn execute(&self, query: &Query) -> Result<String>;
}

/// Resolves the executor for a datasource
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn executor(&self, datasource: &Datasource) -> Result<Arc<dyn Executor>>;
}

/// Echoes the statement back; used by the `test` datasource kind
#[derive(Debug, Clone, Copy, Default)]
pub struct TestExecutor;

#[async_trait]
impl Executor for TestExecutor {
    async fn execute(&self, query: &Query) -> Result<String> {
        Ok(format!("Got: {}", query.sql))
    }
}

type PoolKey = (DatasourceKind, String);

/// Memoises one executor per `(kind, options)`
pub struct DriverRegistry {
    config: ExecutorConfig,
    executors: RwLock<HashMap<PoolKey, Arc<dyn Executor>>>,
}

impl DriverRegistry {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            executors: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live executors
    pub async fn len(&self) -> usize {
        self.executors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executors.read().await.is_empty()
    }

    fn build(&self, kind: DatasourceKind, options: &str) -> Result<Arc<dyn Executor>> {
        let executor: Arc<dyn Executor> = match kind {
            DatasourceKind::Test => Arc::new(TestExecutor),
            DatasourceKind::Postgres => Arc::new(PostgresExecutor::new(options, &self.config)?),
            DatasourceKind::Mysql => Arc::new(MySqlExecutor::new(options, &self.config)?),
            DatasourceKind::Snowflake => Arc::new(SnowflakeExecutor::new(options, &self.config)?),
        };
        Ok(executor)
    }
}

#[async_trait]
impl ExecutorFactory for DriverRegistry {
    async fn executor(&self, datasource: &Datasource) -> Result<Arc<dyn Executor>> {
        let key = (datasource.kind, datasource.options.clone());

        if let Some(found) = self.executors.read().await.get(&key) {
            return Ok(found.clone());
        }

        let mut executors = self.executors.write().await;
        // Another request may have built it while we waited for the lock
        if let Some(found) = executors.get(&key) {
            return Ok(found.clone());
        }

        let executor = self.build(datasource.kind, &datasource.options)?;
        info!(driver = %datasource.kind, datasource_id = %datasource.id, "Created executor");
        executors.insert(key, executor.clone());
        Ok(executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duration::Lifetime;
    use crate::errors::AppError;
    use chrono::Utc;

    fn datasource(id: &str, kind: DatasourceKind, options: &str) -> Datasource {
        let now = Utc::now();
        Datasource {
            id: id.to_string(),
            user_id: "u-1".into(),
            name: "ds".into(),
            kind,
            options: options.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn query(sql: &str) -> Query {
        let now = Utc::now();
        Query {
            id: "q-1".into(),
            user_id: "u-1".into(),
            sql: sql.to_string(),
            datasource_id: Some("d-1".into()),
            lifetime: Lifetime::from_secs(60),
            created_at: now,
            updated_at: now,
            last_refresh: now,
        }
    }

    #[tokio::test]
    async fn test_test_executor_echoes_sql() {
        let out = TestExecutor.execute(&query("SELECT * FROM users")).await.unwrap();
        assert_eq!(out, "Got: SELECT * FROM users");
    }

    #[tokio::test]
    async fn test_registry_shares_by_kind_and_options() {
        let registry = DriverRegistry::new(ExecutorConfig::default());
        assert!(registry.is_empty().await);

        let a = registry
            .executor(&datasource("d-1", DatasourceKind::Test, ""))
            .await
            .unwrap();
        let b = registry
            .executor(&datasource("d-2", DatasourceKind::Test, ""))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        registry
            .executor(&datasource("d-3", DatasourceKind::Test, "other"))
            .await
            .unwrap();
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_registry_pools_are_lazy() {
        let registry = DriverRegistry::new(ExecutorConfig::default());
        let pg = datasource("d-1", DatasourceKind::Postgres, "postgres://bissy@localhost:1/none");
        assert!(registry.executor(&pg).await.is_ok());
    }

    #[tokio::test]
    async fn test_registry_rejects_bad_options() {
        let registry = DriverRegistry::new(ExecutorConfig::default());
        let bad = datasource("d-1", DatasourceKind::Snowflake, "not a url");
        assert!(matches!(
            registry.executor(&bad).await,
            Err(AppError::ExecutionFailure { .. })
        ));
        assert!(registry.is_empty().await);
    }
}
