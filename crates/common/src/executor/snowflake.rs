//! Snowflake executor over the SQL API v2
//!
//! Options are a URL:
//! `snowflake://<account>/<database>/<schema>?warehouse=&role=&token=&token_type=&endpoint=`
//! where `endpoint` overrides `https://<account>.snowflakecomputing.com`.

use super::csv::{self as cells, CsvArtifact};
use super::Executor;
use crate::config::ExecutorConfig;
use crate::errors::{AppError, Result};
use crate::models::Query;
use async_trait::async_trait;
use chrono::FixedOffset;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Parsed connection options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnowflakeOptions {
    pub base_url: String,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub warehouse: Option<String>,
    pub role: Option<String>,
    pub token: String,
    pub token_type: Option<String>,
}

impl SnowflakeOptions {
    pub fn parse(options: &str) -> Result<Self> {
        let url = Url::parse(options).map_err(|e| invalid(format!("not a URL: {}", e)))?;
        if url.scheme() != "snowflake" {
            return Err(invalid(format!("unexpected scheme '{}'", url.scheme())));
        }
        let account = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing account".to_string()))?;

        let mut segments = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).map(String::from).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter();
        let database = segments.next();
        let schema = segments.next();

        let mut parsed = Self {
            base_url: format!("https://{}.snowflakecomputing.com", account),
            database,
            schema,
            warehouse: None,
            role: None,
            token: String::new(),
            token_type: None,
        };

        for (key, value) in url.query_pairs() {
            let value = value.into_owned();
            match key.as_ref() {
                "warehouse" => parsed.warehouse = Some(value),
                "role" => parsed.role = Some(value),
                "token" => parsed.token = value,
                "token_type" => parsed.token_type = Some(value),
                "endpoint" => parsed.base_url = value.trim_end_matches('/').to_string(),
                _ => {}
            }
        }

        if parsed.token.is_empty() {
            return Err(invalid("missing token".to_string()));
        }
        Ok(parsed)
    }
}

fn invalid(reason: String) -> AppError {
    AppError::ExecutionFailure {
        message: format!("Invalid snowflake options: {}", reason),
    }
}

#[derive(Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<Value>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    row_type: Vec<RowType>,
    #[serde(default)]
    partition_info: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct PartitionResponse {
    #[serde(default)]
    data: Vec<Vec<Option<Value>>>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct SnowflakeExecutor {
    client: reqwest::Client,
    options: SnowflakeOptions,
    timeout_secs: u64,
}

impl SnowflakeExecutor {
    pub fn new(options: &str, config: &ExecutorConfig) -> Result<Self> {
        let options = SnowflakeOptions::parse(options)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.snowflake_request_timeout_secs))
            .user_agent(format!("bissy/{}", crate::VERSION))
            .build()?;

        Ok(Self {
            client,
            options,
            timeout_secs: config.execution_timeout_secs,
        })
    }

    fn statements_url(&self) -> String {
        format!("{}/api/v2/statements", self.options.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request
            .bearer_auth(&self.options.token)
            .header(reqwest::header::ACCEPT, "application/json");
        match &self.options.token_type {
            Some(token_type) => request.header("X-Snowflake-Authorization-Token-Type", token_type),
            None => request,
        }
    }

    /// Submit the statement and wait until Snowflake reports a result
    async fn submit(&self, sql: &str) -> Result<StatementResponse> {
        let body = StatementRequest {
            statement: sql,
            timeout: self.timeout_secs,
            database: self.options.database.as_deref(),
            schema: self.options.schema.as_deref(),
            warehouse: self.options.warehouse.as_deref(),
            role: self.options.role.as_deref(),
        };

        let response = self
            .authorize(self.client.post(self.statements_url()))
            .json(&body)
            .send()
            .await?;
        let mut result = read_statement(response).await?;

        loop {
            match result {
                Polled::Done(done) => return Ok(done),
                Polled::Running(handle) => {
                    debug!(statement_handle = %handle, "Snowflake statement still running");
                    tokio::time::sleep(POLL_INTERVAL).await;
                    let url = format!("{}/{}", self.statements_url(), handle);
                    let response = self.authorize(self.client.get(url)).send().await?;
                    result = read_statement(response).await?;
                }
            }
        }
    }

    async fn partition(&self, handle: &str, index: usize) -> Result<Vec<Vec<Option<Value>>>> {
        let url = format!("{}/{}", self.statements_url(), handle);
        let response = self
            .authorize(self.client.get(url))
            .query(&[("partition", index)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let partition: PartitionResponse = response.json().await?;
        Ok(partition.data)
    }
}

enum Polled {
    Done(StatementResponse),
    Running(String),
}

async fn read_statement(response: reqwest::Response) -> Result<Polled> {
    match response.status() {
        StatusCode::OK => Ok(Polled::Done(response.json().await?)),
        StatusCode::ACCEPTED => {
            let pending: StatementResponse = response.json().await?;
            pending
                .statement_handle
                .map(Polled::Running)
                .ok_or_else(|| AppError::ExecutionFailure {
                    message: "Snowflake accepted the statement without a handle".to_string(),
                })
        }
        _ => Err(api_error(response).await),
    }
}

async fn api_error(response: reqwest::Response) -> AppError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(ErrorResponse {
            code: Some(code),
            message: Some(message),
        }) => format!("{} ({})", message, code),
        Ok(ErrorResponse {
            message: Some(message),
            ..
        }) => message,
        _ => body,
    };
    AppError::ExecutionFailure {
        message: format!("Snowflake API error {}: {}", status, message),
    }
}

#[async_trait]
impl Executor for SnowflakeExecutor {
    async fn execute(&self, query: &Query) -> Result<String> {
        let first = self.submit(&query.sql).await?;
        let meta = first
            .result_set_meta_data
            .ok_or_else(|| AppError::ExecutionFailure {
                message: "Snowflake response has no result metadata".to_string(),
            })?;

        let mut artifact = CsvArtifact::with_header(meta.row_type.iter().map(|c| c.name.as_str()))?;
        write_rows(&mut artifact, &meta.row_type, first.data)?;

        // Partition 0 arrives with the statement response
        if meta.partition_info.len() > 1 {
            let handle = first.statement_handle.unwrap_or_default();
            for index in 1..meta.partition_info.len() {
                let data = self.partition(&handle, index).await?;
                write_rows(&mut artifact, &meta.row_type, data)?;
            }
        }

        debug!(query_id = %query.id, partitions = meta.partition_info.len(), "Snowflake query finished");
        artifact.finish()
    }
}

fn write_rows(
    artifact: &mut CsvArtifact,
    columns: &[RowType],
    data: Vec<Vec<Option<Value>>>,
) -> Result<()> {
    for row in data {
        let cells = row
            .into_iter()
            .zip(columns)
            .map(|(cell, column)| cell.map(|value| render_cell(&column.kind, value)));
        artifact.push_row(cells)?;
    }
    Ok(())
}

fn render_cell(kind: &str, value: Value) -> String {
    let text = match value {
        Value::String(s) => s,
        Value::Null => return String::new(),
        other => other.to_string(),
    };

    let converted = match kind {
        "timestamp_ntz" | "timestamp_ltz" => cells::epoch_seconds(&text).map(|at| cells::rfc3339(&at)),
        "timestamp_tz" => timestamp_tz(&text),
        "date" => text
            .parse::<i64>()
            .ok()
            .and_then(|days| days.checked_mul(86_400))
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .map(|at| cells::rfc3339(&at)),
        "binary" => hex::decode(&text).ok().map(|raw| cells::bytes(&raw)),
        _ => None,
    };
    converted.unwrap_or(text)
}

/// `<epoch seconds> <offset minutes + 1440>`
fn timestamp_tz(text: &str) -> Option<String> {
    let (epoch, offset) = text.split_once(' ')?;
    let minutes: i32 = offset.parse::<i32>().ok()? - 1440;
    let zone = FixedOffset::east_opt(minutes * 60)?;
    cells::epoch_seconds(epoch).map(|at| cells::rfc3339(&at.with_timezone(&zone)))
}
