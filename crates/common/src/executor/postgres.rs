//! PostgreSQL executor
//!
//! The header comes from preparing the statement, so empty results still
//! carry their column names. Rows are read over the simple-query protocol,
//! which hands every cell over as text.

use super::csv::{self as cells, CsvArtifact};
use super::Executor;
use crate::config::ExecutorConfig;
use crate::errors::{AppError, Result};
use crate::models::Query;
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, PgValueRef};
use sqlx::{Column, Decode, Executor as _, Postgres, Row, Statement, TypeInfo, ValueRef};
use std::time::Duration;
use tracing::debug;

pub struct PostgresExecutor {
    pool: PgPool,
}

impl PostgresExecutor {
    /// Build a lazily connecting pool from a `postgres://` URL
    pub fn new(options: &str, config: &ExecutorConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_lazy(options)
            .map_err(AppError::execution)?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Executor for PostgresExecutor {
    async fn execute(&self, query: &Query) -> Result<String> {
        let statement = (&self.pool).prepare(query.sql.as_str()).await?;
        let mut artifact = CsvArtifact::with_header(statement.columns().iter().map(|c| c.name()))?;

        let mut rows = sqlx::raw_sql(query.sql.as_str()).fetch(&self.pool);
        let mut count = 0usize;
        while let Some(row) = rows.try_next().await? {
            artifact.push_row(render_row(&row)?)?;
            count += 1;
        }

        debug!(query_id = %query.id, rows = count, "Postgres query finished");
        artifact.finish()
    }
}

fn render_row(row: &PgRow) -> Result<Vec<Option<String>>> {
    (0..row.len())
        .map(|i| {
            let type_name = row.column(i).type_info().name().to_string();
            let value = row.try_get_raw(i)?;
            render_cell(&type_name, value)
        })
        .collect()
}

fn render_cell(type_name: &str, value: PgValueRef<'_>) -> Result<Option<String>> {
    if value.is_null() {
        return Ok(None);
    }

    if type_name == "BYTEA" {
        let raw = <Vec<u8> as Decode<'_, Postgres>>::decode(value).map_err(AppError::execution)?;
        return Ok(Some(cells::bytes(&raw)));
    }

    let text = <&str as Decode<'_, Postgres>>::decode(value).map_err(AppError::execution)?;
    Ok(Some(render_text(type_name, text)))
}

/// Textual cell to artifact text, keyed by the server's type name
fn render_text(type_name: &str, text: &str) -> String {
    let converted = match type_name {
        "TIMESTAMPTZ" => cells::timestamp_with_zone(text),
        "TIMESTAMP" => cells::timestamp_without_zone(text),
        "DATE" => cells::date(text),
        "BOOL" => match text {
            "t" => Some("true".to_string()),
            "f" => Some("false".to_string()),
            _ => None,
        },
        _ => None,
    };
    converted.unwrap_or_else(|| text.to_string())
}
