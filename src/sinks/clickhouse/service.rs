//! The HTTP service behind the ClickHouse sink.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, Request, StatusCode};
use hyper::Body;
use indexmap::IndexMap;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use snafu::ResultExt;

use super::encoder::encode_rows;
use crate::batcher::Batch;
use crate::config::schema::TableSchema;
use crate::http::{status, Auth, HttpClient};
use crate::sinks::{BatchWriter, CommitResult, TransportSnafu, WriteError};

/// ClickHouse exception codes worth retrying: timeouts, admission limits,
/// and part-merge pressure. Everything else is treated as a data problem.
const RETRIABLE_EXCEPTION_CODES: &[u32] = &[
    159, // TIMEOUT_EXCEEDED
    202, // TOO_MANY_SIMULTANEOUS_QUERIES
    209, // SOCKET_TIMEOUT
    241, // MEMORY_LIMIT_EXCEEDED
    252, // TOO_MANY_PARTS
];

const EXCEPTION_CODE_HEADER: &str = "x-clickhouse-exception-code";

/// Batch writer for the ClickHouse HTTP interface.
///
/// Each batch becomes one `INSERT ... FORMAT JSONEachRow` request carrying a
/// deterministic `insert_deduplication_token`, so a retry after an ambiguous
/// failure cannot double-insert.
#[derive(Clone)]
pub struct ClickhouseService {
    client: HttpClient,
    endpoint: String,
    database: String,
    auth: Option<Auth>,
    schemas: IndexMap<String, Arc<TableSchema>>,
}

impl ClickhouseService {
    pub fn new(
        client: HttpClient,
        endpoint: String,
        database: String,
        auth: Option<Auth>,
        schemas: IndexMap<String, Arc<TableSchema>>,
    ) -> Self {
        Self {
            client,
            endpoint,
            database,
            auth,
            schemas,
        }
    }

    /// Probe the destination with the built-in `/ping` handler.
    pub async fn healthcheck(&self) -> Result<(), WriteError> {
        let mut request = Request::builder()
            .method(Method::GET)
            .uri(format!("{}/ping", self.endpoint))
            .body(Body::empty())
            .context(crate::http::BuildRequestSnafu)
            .context(TransportSnafu)?;
        if let Some(auth) = &self.auth {
            auth.apply(&mut request);
        }
        let response = self.client.send(request).await.context(TransportSnafu)?;
        classify_status(response.status(), response.headers(), response.body())
    }

    fn insert_uri(&self, table: &str, columns: &TableSchema, dedup_token: &str) -> String {
        let mut query = format!("INSERT INTO \"{}\".\"{}\" (", self.database, table);
        for (i, name) in columns.column_names().enumerate() {
            if i > 0 {
                query.push_str(", ");
            }
            let _ = write!(query, "\"{}\"", name);
        }
        query.push_str(") FORMAT JSONEachRow");

        format!(
            "{}/?query={}&insert_deduplication_token={}&date_time_input_format=best_effort",
            self.endpoint,
            utf8_percent_encode(&query, NON_ALPHANUMERIC),
            utf8_percent_encode(dedup_token, NON_ALPHANUMERIC),
        )
    }
}

#[async_trait]
impl BatchWriter for ClickhouseService {
    async fn write(&self, batch: &Batch) -> Result<CommitResult, WriteError> {
        let schema = self
            .schemas
            .get(&batch.table)
            .ok_or_else(|| WriteError::UnknownTable {
                table: batch.table.clone(),
            })?;

        let uri = self.insert_uri(&batch.table, schema, &batch.dedup_token());
        let body = encode_rows(&batch.rows);
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/x-ndjson")
            .body(Body::from(body))
            .context(crate::http::BuildRequestSnafu)
            .context(TransportSnafu)?;
        if let Some(auth) = &self.auth {
            auth.apply(&mut request);
        }

        let response = self.client.send(request).await.context(TransportSnafu)?;
        classify_status(response.status(), response.headers(), response.body())?;

        Ok(CommitResult {
            rows: batch.rows.len(),
            max_offsets: batch.max_offsets.clone(),
        })
    }
}

fn classify_status(
    status_code: StatusCode,
    headers: &http::HeaderMap,
    body: &bytes::Bytes,
) -> Result<(), WriteError> {
    if status_code.is_success() {
        return Ok(());
    }
    let status_code = status_code.as_u16();
    if status_code == status::TOO_MANY_REQUESTS || status_code == status::SERVICE_UNAVAILABLE {
        return Err(WriteError::Backpressure {
            status: status_code,
        });
    }
    let code = headers
        .get(EXCEPTION_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u32>().ok());
    let retriable = code.is_some_and(|c| RETRIABLE_EXCEPTION_CODES.contains(&c));
    Err(WriteError::Rejected {
        code,
        message: body_snippet(body),
        retriable,
    })
}

/// First line of the exception body, bounded so log lines stay readable.
fn body_snippet(body: &bytes::Bytes) -> String {
    let text = String::from_utf8_lossy(body);
    let line = text.lines().next().unwrap_or("");
    let mut snippet = line.chars().take(200).collect::<String>();
    if snippet.len() < line.len() {
        snippet.push_str("...");
    }
    snippet
}
