//! ClickHouse HTTP sink: JSONEachRow inserts with deduplication tokens.

mod encoder;
mod service;

pub use service::ClickhouseService;

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_with::serde_as;

use crate::config::schema::TableSchema;
use crate::http::{Auth, HttpClient};

/// Connection settings for the ClickHouse HTTP interface.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClickhouseConfig {
    /// Base URL of the HTTP interface, e.g. `http://localhost:8123`.
    pub endpoint: String,

    pub database: String,

    #[serde(default)]
    pub auth: Option<Auth>,

    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    #[serde(rename = "request_timeout_ms", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl ClickhouseConfig {
    pub fn build(&self, schemas: &IndexMap<String, Arc<TableSchema>>) -> ClickhouseService {
        ClickhouseService::new(
            HttpClient::new(self.request_timeout),
            self.endpoint.trim_end_matches('/').to_string(),
            self.database.clone(),
            self.auth.clone(),
            schemas.clone(),
        )
    }
}
