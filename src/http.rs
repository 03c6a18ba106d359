//! HTTP operation
//!
//! [`HttpOperation`] performs one GET or POST per attempt with a shared
//! `reqwest::Client` and reports failures as [`RawFailure`]s:
//!
//! | Outcome | Failure |
//! |---------|---------|
//! | non-2xx status | `Status { code, message: body }` |
//! | request or body read timed out | `Timeout` |
//! | connect / send failure | `Connection` |
//! | body not decodable | `Schema` |

use std::time::Duration;

use reqwest::{Client, Method, Url};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::classify::RawFailure;
use crate::error::{LexguardError, Result};
use crate::operation::Operation;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REDIRECT_LIMIT: usize = 5;
/// Error bodies longer than this are cut before landing in a record
const MAX_ERROR_BODY: usize = 512;

/// Successful response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// One HTTP request, repeatable across attempts
#[derive(Clone)]
pub struct HttpOperation {
    client: Client,
    method: Method,
    url: Url,
    headers: Vec<(String, String)>,
    body: Option<String>,
    timeout: Option<Duration>,
}

impl HttpOperation {
    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::GET, url, None)
    }

    pub fn post(url: &str, body: impl Into<String>) -> Result<Self> {
        Self::new(Method::POST, url, Some(body.into()))
    }

    fn new(method: Method, url: &str, body: Option<String>) -> Result<Self> {
        Ok(Self {
            client: default_client()?,
            method,
            url: parse_url(url)?,
            headers: Vec::new(),
            body,
            timeout: None,
        })
    }

    /// Share an existing client (connection pooling across operations)
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Client-side deadline for each request, reported as `Timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    #[instrument(skip(self), fields(method = %self.method, url = %self.url))]
    async fn send(&self) -> std::result::Result<HttpResponse, RawFailure> {
        let started = Instant::now();

        let mut request = self.client.request(self.method.clone(), self.url.clone());
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &self.body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| send_failure(e, started))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| body_failure(e, started))?;
        debug!(status = status.as_u16(), bytes = body.len(), "HTTP response");

        if !status.is_success() {
            return Err(RawFailure::status(status.as_u16(), truncate(&body)));
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            body,
        })
    }
}

impl Operation for HttpOperation {
    type Output = HttpResponse;

    async fn invoke(&mut self) -> std::result::Result<HttpResponse, RawFailure> {
        self.send().await
    }
}

impl std::fmt::Debug for HttpOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOperation")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Client used when none is supplied
pub fn default_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(REDIRECT_LIMIT))
        .user_agent(concat!("lexguard/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| LexguardError::HttpClient {
            reason: e.to_string(),
        })
}

fn parse_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| LexguardError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(LexguardError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

fn send_failure(error: reqwest::Error, started: Instant) -> RawFailure {
    if error.is_timeout() {
        RawFailure::Timeout {
            elapsed: started.elapsed(),
        }
    } else if error.is_connect() || error.is_request() {
        RawFailure::connection(error.to_string())
    } else {
        RawFailure::other(error.to_string())
    }
}

fn body_failure(error: reqwest::Error, started: Instant) -> RawFailure {
    if error.is_timeout() {
        RawFailure::Timeout {
            elapsed: started.elapsed(),
        }
    } else if error.is_decode() {
        RawFailure::Schema {
            message: format!("Failed to decode response body: {}", error),
        }
    } else {
        RawFailure::connection(format!("Failed to read response: {}", error))
    }
}

fn truncate(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= MAX_ERROR_BODY {
        return trimmed.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
