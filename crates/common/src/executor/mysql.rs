//! MySQL executor
//!
//! Same shape as the Postgres executor: header from the prepared statement,
//! rows over the text protocol.

use super::csv::{self as cells, CsvArtifact};
use super::Executor;
use crate::config::ExecutorConfig;
use crate::errors::{AppError, Result};
use crate::models::Query;
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow, MySqlValueRef};
use sqlx::{Column, Decode, Executor as _, MySql, Row, Statement, TypeInfo, ValueRef};
use std::time::Duration;
use tracing::debug;

pub struct MySqlExecutor {
    pool: MySqlPool,
}

impl MySqlExecutor {
    /// Build a lazily connecting pool from a `mysql://` URL
    pub fn new(options: &str, config: &ExecutorConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_lazy(options)
            .map_err(AppError::execution)?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Executor for MySqlExecutor {
    async fn execute(&self, query: &Query) -> Result<String> {
        let statement = (&self.pool).prepare(query.sql.as_str()).await?;
        let mut artifact = CsvArtifact::with_header(statement.columns().iter().map(|c| c.name()))?;

        let mut rows = sqlx::raw_sql(query.sql.as_str()).fetch(&self.pool);
        let mut count = 0usize;
        while let Some(row) = rows.try_next().await? {
            artifact.push_row(render_row(&row)?)?;
            count += 1;
        }

        debug!(query_id = %query.id, rows = count, "MySQL query finished");
        artifact.finish()
    }
}

fn render_row(row: &MySqlRow) -> Result<Vec<Option<String>>> {
    (0..row.len())
        .map(|i| {
            let type_name = row.column(i).type_info().name().to_string();
            let value = row.try_get_raw(i)?;
            render_cell(&type_name, value)
        })
        .collect()
}

fn render_cell(type_name: &str, value: MySqlValueRef<'_>) -> Result<Option<String>> {
    if value.is_null() {
        return Ok(None);
    }

    // The text protocol delivers every cell as bytes; binary columns included
    let raw = <&[u8] as Decode<'_, MySql>>::decode(value).map_err(AppError::execution)?;
    Ok(Some(render_text(type_name, &cells::bytes(raw))))
}

fn render_text(type_name: &str, text: &str) -> String {
    let converted = match type_name {
        "DATETIME" | "TIMESTAMP" => cells::timestamp_without_zone(text),
        "DATE" => cells::date(text),
        "BOOLEAN" => match text {
            "1" => Some("true".to_string()),
            "0" => Some("false".to_string()),
            _ => None,
        },
        _ => None,
    };
    converted.unwrap_or_else(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_text() {
        assert_eq!(render_text("BIGINT", "-7"), "-7");
        assert_eq!(render_text("DOUBLE", "1.5"), "1.5");
        assert_eq!(render_text("DATETIME", "2024-05-01 12:00:00"), "2024-05-01T12:00:00Z");
        assert_eq!(render_text("TIMESTAMP", "2024-05-01 12:00:00.250"), "2024-05-01T12:00:00Z");
        assert_eq!(render_text("DATE", "2024-05-01"), "2024-05-01T00:00:00Z");
        // Zero dates have no calendar value
        assert_eq!(render_text("DATE", "0000-00-00"), "0000-00-00");
        assert_eq!(render_text("BOOLEAN", "1"), "true");
        assert_eq!(render_text("VARCHAR", "x\"y"), "x\"y");
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let result = MySqlExecutor::new("::not a url::", &ExecutorConfig::default());
        assert!(matches!(result, Err(AppError::ExecutionFailure { .. })));
    }
}
