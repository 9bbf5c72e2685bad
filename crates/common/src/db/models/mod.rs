//! SeaORM entity models
//!
//! Conversions into the domain types live here so the repository only deals
//! with domain values.

mod api_key;
mod datasource;
mod query;

pub use datasource::{
    Entity as DatasourceEntity,
    Model as DatasourceRow,
    ActiveModel as DatasourceActiveModel,
    Column as DatasourceColumn,
};

pub use query::{
    Entity as QueryEntity,
    Model as QueryRow,
    ActiveModel as QueryActiveModel,
    Column as QueryColumn,
};

pub use api_key::{
    Entity as ApiKeyEntity,
    Model as ApiKeyRow,
    ActiveModel as ApiKeyActiveModel,
    Column as ApiKeyColumn,
};

use crate::duration::Lifetime;
use crate::errors::{AppError, Result};
use crate::models::{ApiKey, Datasource, Query};
use chrono::Utc;

impl TryFrom<DatasourceRow> for Datasource {
    type Error = AppError;

    fn try_from(row: DatasourceRow) -> Result<Self> {
        Ok(Self {
            kind: row.kind.parse()?,
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            options: row.options,
            created_at: row.created_at.with_timezone(&Utc),
            updated_at: row.updated_at.with_timezone(&Utc),
        })
    }
}

impl From<QueryRow> for Query {
    fn from(row: QueryRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            sql: row.sql,
            datasource_id: row.datasource_id,
            lifetime: Lifetime::from_nanos(row.lifetime),
            created_at: row.created_at.with_timezone(&Utc),
            updated_at: row.updated_at.with_timezone(&Utc),
            last_refresh: row.last_refresh.with_timezone(&Utc),
        }
    }
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            last_used: row.last_used.map(|at| at.with_timezone(&Utc)),
            created_at: row.created_at.with_timezone(&Utc),
        }
    }
}
