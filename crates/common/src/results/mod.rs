//! Cached query execution
//!
//! Serves a query's CSV artifact from the cache while it is fresh and
//! re-executes it otherwise. After a successful execution the artifact is
//! cached and `last_refresh` moves to now; both writes are best-effort.

use crate::cache::ResultCache;
use crate::clock::Clock;
use crate::errors::{AppError, Result};
use crate::executor::ExecutorFactory;
use crate::metrics;
use crate::models::UpdateQuery;
use crate::store::{DatasourceStore, QueryStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

pub struct ResultService {
    queries: Arc<dyn QueryStore>,
    datasources: Arc<dyn DatasourceStore>,
    cache: Arc<dyn ResultCache>,
    executors: Arc<dyn ExecutorFactory>,
    clock: Arc<dyn Clock>,
    execution_timeout: Option<Duration>,
}

impl ResultService {
    pub fn new(
        queries: Arc<dyn QueryStore>,
        datasources: Arc<dyn DatasourceStore>,
        cache: Arc<dyn ResultCache>,
        executors: Arc<dyn ExecutorFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queries,
            datasources,
            cache,
            executors,
            clock,
            execution_timeout: None,
        }
    }

    /// Bound every execution; `None` waits indefinitely
    pub fn with_execution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Latest artifact of a query owned by `user_id`.
    ///
    /// Dropping the returned future abandons an in-flight execution; nothing
    /// is written in that case.
    #[instrument(skip(self))]
    pub async fn result(&self, user_id: &str, query_id: &str) -> Result<String> {
        let query = self.queries.get(user_id, query_id).await?;

        let datasource_id = query.datasource_id.as_deref().ok_or_else(|| {
            AppError::DatasourceMissing {
                query_id: query.id.clone(),
            }
        })?;
        let datasource = self
            .datasources
            .get(user_id, datasource_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    AppError::DatasourceMissing {
                        query_id: query.id.clone(),
                    }
                } else {
                    e
                }
            })?;

        if query.is_fresh(self.clock.now()) {
            if let Some(cached) = self.cache.get(&query).await {
                metrics::record_cache(true, self.cache.name());
                debug!("Serving cached artifact");
                return Ok(cached);
            }
        }
        metrics::record_cache(false, self.cache.name());

        let executor = self.executors.executor(&datasource).await?;
        let started = Instant::now();
        let outcome = match self.execution_timeout {
            Some(limit) => tokio::time::timeout(limit, executor.execute(&query))
                .await
                .unwrap_or_else(|_| {
                    Err(AppError::ExecutionTimeout {
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    })
                }),
            None => executor.execute(&query).await,
        };
        let elapsed = started.elapsed().as_secs_f64();
        metrics::record_execution(elapsed, datasource.kind.as_str(), outcome.is_ok());

        let artifact = match outcome {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(driver = %datasource.kind, error = %e, "Query execution failed");
                return Err(e);
            }
        };

        if let Err(e) = self.cache.set(&query, &artifact).await {
            metrics::record_refresh_failure("cache");
            warn!(error = %e, "Failed to cache artifact");
        }

        let refreshed_at = self.clock.now();
        if let Err(e) = self
            .queries
            .update(user_id, &query.id, UpdateQuery::refreshed_at(refreshed_at))
            .await
        {
            metrics::record_refresh_failure("store");
            warn!(error = %e, "Failed to record last_refresh");
        }

        info!(driver = %datasource.kind, elapsed_secs = elapsed, bytes = artifact.len(), "Query refreshed");
        Ok(artifact)
    }

    /// Drop the cached artifact of a query; failures are logged only
    pub async fn forget(&self, query_id: &str) {
        if let Err(e) = self.cache.invalidate(query_id).await {
            warn!(query_id = %query_id, error = %e, "Failed to invalidate cached artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::clock::{ManualClock, SequentialIds};
    use crate::duration::Lifetime;
    use crate::executor::Executor;
    use crate::models::{CreateDatasource, CreateQuery, Datasource, DatasourceKind, Query};
    use crate::store::{InMemoryDatasourceStore, InMemoryQueryStore};
    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts executions and echoes the statement
    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Executor for Counting {
        async fn execute(&self, query: &Query) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("Got: {}", query.sql))
        }
    }

    struct Failing;

    #[async_trait]
    impl Executor for Failing {
        async fn execute(&self, _query: &Query) -> Result<String> {
            Err(AppError::ExecutionFailure {
                message: "relation \"users\" does not exist".to_string(),
            })
        }
    }

    struct Stalling;

    #[async_trait]
    impl Executor for Stalling {
        async fn execute(&self, _query: &Query) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(String::new())
        }
    }

    struct Fixed(Arc<dyn Executor>);

    #[async_trait]
    impl ExecutorFactory for Fixed {
        async fn executor(&self, _datasource: &Datasource) -> Result<Arc<dyn Executor>> {
            Ok(self.0.clone())
        }
    }

    struct Harness {
        service: ResultService,
        queries: Arc<InMemoryQueryStore>,
        datasources: Arc<InMemoryDatasourceStore>,
        cache: Arc<InMemoryCache>,
        clock: Arc<ManualClock>,
    }

    fn harness(executor: Arc<dyn Executor>) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let queries = Arc::new(InMemoryQueryStore::new(
            clock.clone(),
            Arc::new(SequentialIds::new("q")),
        ));
        let datasources = Arc::new(InMemoryDatasourceStore::new(
            clock.clone(),
            Arc::new(SequentialIds::new("d")),
        ));
        let cache = Arc::new(InMemoryCache::new());
        let service = ResultService::new(
            queries.clone(),
            datasources.clone(),
            cache.clone(),
            Arc::new(Fixed(executor)),
            clock.clone(),
        );
        Harness {
            service,
            queries,
            datasources,
            cache,
            clock,
        }
    }

    async fn seed(h: &Harness, user: &str, lifetime: Lifetime) -> Query {
        let ds = h
            .datasources
            .create(
                user,
                CreateDatasource {
                    name: "warehouse".into(),
                    kind: DatasourceKind::Test,
                    options: String::new(),
                },
            )
            .await
            .unwrap();
        h.queries
            .create(
                user,
                CreateQuery {
                    sql: "SELECT * FROM users".into(),
                    lifetime,
                    datasource_id: Some(ds.id),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_cold_read_then_cache_hit() {
        let counting = Arc::new(Counting::default());
        let h = harness(counting.clone());
        let q = seed(&h, "alice", Lifetime::from_secs(3_600)).await;

        let first = h.service.result("alice", &q.id).await.unwrap();
        assert_eq!(first, "Got: SELECT * FROM users");
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        h.clock.advance(TimeDelta::minutes(30));
        let second = h.service.result("alice", &q.id).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_read_executes_and_refreshes() {
        let counting = Arc::new(Counting::default());
        let h = harness(counting.clone());
        let q = seed(&h, "alice", Lifetime::from_secs(60)).await;

        h.service.result("alice", &q.id).await.unwrap();
        h.clock.advance(TimeDelta::seconds(60));
        h.service.result("alice", &q.id).await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);

        let stored = h.queries.get("alice", &q.id).await.unwrap();
        assert_eq!(stored.last_refresh, h.clock.now());
    }

    #[tokio::test]
    async fn test_zero_lifetime_always_executes() {
        let counting = Arc::new(Counting::default());
        let h = harness(counting.clone());
        let q = seed(&h, "alice", Lifetime::ZERO).await;

        for _ in 0..3 {
            h.service.result("alice", &q.id).await.unwrap();
        }
        assert_eq!(counting.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fresh_but_uncached_executes() {
        let counting = Arc::new(Counting::default());
        let h = harness(counting.clone());
        let q = seed(&h, "alice", Lifetime::from_secs(3_600)).await;

        // Freshly created queries count as refreshed at creation, yet nothing is cached
        h.service.result("alice", &q.id).await.unwrap();
        h.service.forget(&q.id).await;
        h.service.result("alice", &q.id).await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_writes_nothing() {
        let h = harness(Arc::new(Failing));
        let q = seed(&h, "alice", Lifetime::from_secs(60)).await;
        h.clock.advance(TimeDelta::seconds(5));

        let err = h.service.result("alice", &q.id).await.unwrap_err();
        assert!(matches!(err, AppError::ExecutionFailure { .. }));

        assert_eq!(h.cache.get(&q).await, None);
        let stored = h.queries.get("alice", &q.id).await.unwrap();
        assert_eq!(stored.last_refresh, q.last_refresh);
    }

    #[tokio::test]
    async fn test_other_tenant_gets_not_found() {
        let counting = Arc::new(Counting::default());
        let h = harness(counting.clone());
        let q = seed(&h, "alice", Lifetime::from_secs(60)).await;

        let err = h.service.result("bob", &q.id).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_datasource() {
        let h = harness(Arc::new(Counting::default()));
        let q = seed(&h, "alice", Lifetime::from_secs(60)).await;
        let ds_id = q.datasource_id.clone().unwrap();
        h.datasources.delete("alice", &ds_id).await.unwrap();

        assert!(matches!(
            h.service.result("alice", &q.id).await,
            Err(AppError::DatasourceMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_future_refresh_cannot_pin_cached_artifact() {
        let counting = Arc::new(Counting::default());
        let h = harness(counting.clone());
        let q = seed(&h, "alice", Lifetime::from_secs(3_600)).await;
        h.service.result("alice", &q.id).await.unwrap();

        let pinned = h
            .queries
            .update(
                "alice",
                &q.id,
                UpdateQuery::refreshed_at(h.clock.now() + TimeDelta::days(365)),
            )
            .await;
        assert!(matches!(pinned, Err(AppError::Validation { .. })));

        let stored = h.queries.get("alice", &q.id).await.unwrap();
        assert!(stored.last_refresh <= h.clock.now());

        h.clock.advance(TimeDelta::days(30));
        h.service.result("alice", &q.id).await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_execution_timeout() {
        let h = harness(Arc::new(Stalling));
        let q = seed(&h, "alice", Lifetime::from_secs(60)).await;
        let service = h
            .service
            .with_execution_timeout(Some(Duration::from_millis(20)));

        assert!(matches!(
            service.result("alice", &q.id).await,
            Err(AppError::ExecutionTimeout { timeout_ms: 20 })
        ));
    }
}
