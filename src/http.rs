#![allow(missing_docs)]

//! Thin HTTP client used by the ingestion writer.

use std::time::Duration;

use headers::{Authorization, HeaderMapExt};
use http::Request;
use hyper::{client::HttpConnector, Body, Client};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

pub mod status {
    pub const TOO_MANY_REQUESTS: u16 = 429;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    #[snafu(display("Failed to build HTTP request: {}", source))]
    BuildRequest { source: http::Error },
    #[snafu(display("Failed to make HTTP request: {}", source))]
    CallRequest { source: hyper::Error },
    #[snafu(display("HTTP request timed out after {:?}", timeout))]
    RequestTimeout { timeout: Duration },
    #[snafu(display("Failed to read HTTP response body: {}", source))]
    ReadBody { source: hyper::Error },
}

impl HttpError {
    pub const fn is_retriable(&self) -> bool {
        match self {
            HttpError::BuildRequest { .. } => false,
            HttpError::CallRequest { .. }
            | HttpError::RequestTimeout { .. }
            | HttpError::ReadBody { .. } => true,
        }
    }
}

/// Authentication strategy for requests against the destination store.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "strategy")]
pub enum Auth {
    /// HTTP Basic authentication.
    Basic { user: String, password: String },
}

impl Auth {
    pub fn apply<B>(&self, request: &mut Request<B>) {
        match self {
            Auth::Basic { user, password } => request
                .headers_mut()
                .typed_insert(Authorization::basic(user, password)),
        }
    }
}

/// `hyper` client with a per-request timeout and buffered response bodies.
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: Client<HttpConnector>,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::builder().build_http(),
            timeout,
        }
    }

    pub async fn send(
        &self,
        request: Request<Body>,
    ) -> Result<http::Response<bytes::Bytes>, HttpError> {
        let timeout = self.timeout;
        let response = tokio::time::timeout(timeout, self.client.request(request))
            .await
            .map_err(|_| HttpError::RequestTimeout { timeout })?
            .context(CallRequestSnafu)?;
        let (parts, body) = response.into_parts();
        let body = hyper::body::to_bytes(body).await.context(ReadBodySnafu)?;
        Ok(http::Response::from_parts(parts, body))
    }
}
