//! Domain models shared by stores, the result service and the HTTP layer
//!
//! Every entity is owned by exactly one user; the owning `user_id` scopes every
//! store lookup. Wire representations are camelCase JSON.

use crate::duration::Lifetime;
use crate::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use validator::Validate;

/// Backend driver behind a datasource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasourceKind {
    Postgres,
    Mysql,
    Snowflake,
    Test,
}

impl DatasourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasourceKind::Postgres => "postgres",
            DatasourceKind::Mysql => "mysql",
            DatasourceKind::Snowflake => "snowflake",
            DatasourceKind::Test => "test",
        }
    }
}

impl fmt::Display for DatasourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasourceKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "postgres" => Ok(DatasourceKind::Postgres),
            "mysql" => Ok(DatasourceKind::Mysql),
            "snowflake" => Ok(DatasourceKind::Snowflake),
            "test" => Ok(DatasourceKind::Test),
            other => Err(AppError::UnsupportedDriver {
                kind: other.to_string(),
            }),
        }
    }
}

/// A named handle to a SQL backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datasource {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DatasourceKind,
    /// Driver-specific connection string
    pub options: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateDatasource {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DatasourceKind,
    #[serde(default)]
    pub options: String,
}

/// Partial update: `None` leaves the stored value untouched
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateDatasource {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<DatasourceKind>,
    pub options: Option<String>,
}

impl Datasource {
    /// Apply a partial update in place
    pub fn apply(&mut self, update: UpdateDatasource, now: DateTime<Utc>) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(kind) = update.kind {
            self.kind = kind;
        }
        if let Some(options) = update.options {
            self.options = options;
        }
        self.updated_at = now;
    }
}

/// A cached SQL statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "query")]
    pub sql: String,
    pub datasource_id: Option<String>,
    pub lifetime: Lifetime,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_refresh: DateTime<Utc>,
}

impl Query {
    /// Whether the last refresh is younger than the lifetime.
    ///
    /// A zero lifetime is never fresh, so every read executes.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        if self.lifetime.as_nanos() <= 0 {
            return false;
        }
        now.signed_duration_since(self.last_refresh) < self.lifetime.as_time_delta()
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, update: UpdateQuery, now: DateTime<Utc>) {
        if let Some(sql) = update.sql {
            self.sql = sql;
        }
        if let Some(lifetime) = update.lifetime {
            self.lifetime = lifetime;
        }
        if let Some(datasource_id) = update.datasource_id {
            self.datasource_id = Some(datasource_id);
        }
        if let Some(last_refresh) = update.last_refresh {
            self.last_refresh = last_refresh;
        }
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateQuery {
    #[serde(rename = "query")]
    #[validate(length(min = 1))]
    pub sql: String,
    pub lifetime: Lifetime,
    #[serde(default)]
    pub datasource_id: Option<String>,
}

impl CreateQuery {
    pub fn check_lifetime(&self) -> Result<()> {
        check_lifetime(self.lifetime)
    }
}

/// Partial update; `last_refresh` lets owners force the next read to execute
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateQuery {
    #[serde(rename = "query")]
    #[validate(length(min = 1))]
    pub sql: Option<String>,
    pub lifetime: Option<Lifetime>,
    pub datasource_id: Option<String>,
    pub last_refresh: Option<DateTime<Utc>>,
}

impl UpdateQuery {
    /// Update that only moves `last_refresh`
    pub fn refreshed_at(at: DateTime<Utc>) -> Self {
        Self {
            last_refresh: Some(at),
            ..Default::default()
        }
    }

    pub fn check_lifetime(&self) -> Result<()> {
        self.lifetime.map_or(Ok(()), check_lifetime)
    }

    /// `last_refresh` may move back or to now, never past `now`
    pub fn check_last_refresh(&self, now: DateTime<Utc>) -> Result<()> {
        match self.last_refresh {
            Some(at) if at > now => Err(AppError::Validation {
                message: format!(
                    "lastRefresh {} is later than the current time {}",
                    at.to_rfc3339(),
                    now.to_rfc3339()
                ),
                field: Some("lastRefresh".to_string()),
            }),
            _ => Ok(()),
        }
    }
}

fn check_lifetime(lifetime: Lifetime) -> Result<()> {
    if lifetime.is_negative() {
        return Err(AppError::InvalidDuration {
            input: lifetime.to_string(),
        });
    }
    Ok(())
}

/// API key metadata; never carries the secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Creation response: the only place the plaintext key is ever exposed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewApiKey {
    #[serde(flatten)]
    pub api_key: ApiKey,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateApiKey {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
}
