//! Result artifact cache
//!
//! Provides:
//! - The `ResultCache` capability used by the result service
//! - A process-local backend without eviction
//! - A Redis backend whose TTL equals the query lifetime

use crate::config::CacheConfig;
use crate::errors::{AppError, Result};
use crate::models::Query;
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Latest CSV artifact per query
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Backend failures are reported as absence
    async fn get(&self, query: &Query) -> Option<String>;

    /// Store the artifact; last writer wins
    async fn set(&self, query: &Query, artifact: &str) -> Result<()>;

    /// Drop whatever is stored for the query
    async fn invalidate(&self, query_id: &str) -> Result<()>;

    /// Backend health check
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Label used in metrics and logs
    fn name(&self) -> &'static str;
}

/// Process-local cache with no eviction and no TTL
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultCache for InMemoryCache {
    async fn get(&self, query: &Query) -> Option<String> {
        self.entries.read().await.get(&query.id).cloned()
    }

    async fn set(&self, query: &Query, artifact: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(query.id.clone(), artifact.to_string());
        Ok(())
    }

    async fn invalidate(&self, query_id: &str) -> Result<()> {
        self.entries.write().await.remove(query_id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Redis-backed cache client
///
/// Each call works on its own clone of the multiplexed connection.
pub struct RedisCache {
    connection: MultiplexedConnection,
    key_prefix: String,
}

impl RedisCache {
    /// Connect to the configured Redis instance
    pub async fn new(config: &CacheConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| AppError::CacheError {
                message: format!("Failed to create Redis client: {}", e),
            })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::CacheError {
                message: format!("Failed to connect to Redis: {}", e),
            })?;

        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Build a prefixed key
    fn key(&self, query_id: &str) -> String {
        format!("{}:{}", self.key_prefix, keys::result(query_id))
    }
}

#[async_trait]
impl ResultCache for RedisCache {
    async fn get(&self, query: &Query) -> Option<String> {
        let full_key = self.key(&query.id);
        let mut conn = self.conn();

        match conn.get::<_, Option<String>>(&full_key).await {
            Ok(value) => {
                debug!(key = %full_key, hit = value.is_some(), "Cache get");
                value
            }
            Err(e) => {
                warn!(key = %full_key, error = %e, "Cache get failed, treating as miss");
                None
            }
        }
    }

    async fn set(&self, query: &Query, artifact: &str) -> Result<()> {
        let full_key = self.key(&query.id);
        let ttl_ms = query.lifetime.as_millis_ceil();
        let mut conn = self.conn();

        // A zero TTL is rejected by Redis; the artifact would be stale on arrival anyway.
        if ttl_ms == 0 {
            conn.del::<_, i64>(&full_key)
                .await
                .map_err(|e| AppError::CacheError {
                    message: format!("Failed to delete key '{}': {}", full_key, e),
                })?;
            return Ok(());
        }

        conn.pset_ex::<_, _, ()>(&full_key, artifact, ttl_ms)
            .await
            .map_err(|e| AppError::CacheError {
                message: format!("Failed to set key '{}': {}", full_key, e),
            })?;

        debug!(key = %full_key, ttl_ms, "Cache set");
        Ok(())
    }

    async fn invalidate(&self, query_id: &str) -> Result<()> {
        let full_key = self.key(query_id);
        let mut conn = self.conn();

        let deleted: i64 = conn.del(&full_key).await.map_err(|e| AppError::CacheError {
            message: format!("Failed to delete key '{}': {}", full_key, e),
        })?;

        debug!(key = %full_key, deleted = deleted > 0, "Cache invalidate");
        Ok(())
    }

    /// Ping Redis to check connectivity
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| AppError::CacheError {
                message: format!("Redis ping failed: {}", e),
            })?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Cache key builder helpers
pub mod keys {
    /// Key holding the latest artifact of a query
    pub fn result(query_id: &str) -> String {
        format!("result:{}", query_id)
    }
}
