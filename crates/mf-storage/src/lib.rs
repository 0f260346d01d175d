//! Embedded SQLite gateway + HTTP fetch utilities for Media Follower.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod db;

pub use db::{Database, SqlParam, StorageError, Transaction, UpsertOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("request to {url} cancelled")]
    Cancelled { url: String },
}

impl FetchError {
    /// Whether a later run has a reasonable chance of succeeding. Used for log context only.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Decode { .. } => RetryDisposition::NonRetryable,
            FetchError::Cancelled { .. } => RetryDisposition::Retryable,
        }
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Extra request headers as `(name, value)` pairs.
pub type Headers<'a> = &'a [(&'a str, &'a str)];

/// HTTP capability consumed by providers. Every call is bounded by a timeout and
/// observes the process cancellation token.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn fetch_json(&self, url: &str, headers: Headers<'_>) -> Result<JsonValue, FetchError>;

    async fn fetch_text(&self, url: &str, headers: Headers<'_>) -> Result<String, FetchError>;

    async fn fetch_stream(&self, url: &str, headers: Headers<'_>) -> Result<ByteStream, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    cancel: CancellationToken,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, cancel: CancellationToken) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, cancel })
    }

    async fn guarded<T>(
        &self,
        url: &str,
        fut: impl Future<Output = Result<T, reqwest::Error>>,
    ) -> Result<T, FetchError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled { url: url.to_string() }),
            out = fut => out.map_err(FetchError::from),
        }
    }

    async fn send(&self, url: &str, headers: Headers<'_>) -> Result<reqwest::Response, FetchError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        debug!(url, "http fetch");
        let resp = self.guarded(url, request.send()).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl HttpFetch for HttpFetcher {
    async fn fetch_json(&self, url: &str, headers: Headers<'_>) -> Result<JsonValue, FetchError> {
        let text = self.fetch_text(url, headers).await?;
        serde_json::from_str(&text).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }

    async fn fetch_text(&self, url: &str, headers: Headers<'_>) -> Result<String, FetchError> {
        let resp = self.send(url, headers).await?;
        self.guarded(url, resp.text()).await
    }

    async fn fetch_stream(&self, url: &str, headers: Headers<'_>) -> Result<ByteStream, FetchError> {
        let resp = self.send(url, headers).await?;
        let body = resp.bytes_stream().map_err(FetchError::from);
        Ok(until_cancelled(body, self.cancel.clone(), url.to_string()))
    }
}

/// Pass `body` through until `cancel` fires, then yield one [`FetchError::Cancelled`] and end.
pub fn until_cancelled<S>(body: S, cancel: CancellationToken, url: String) -> ByteStream
where
    S: Stream<Item = Result<Bytes, FetchError>> + Send + 'static,
{
    stream::unfold((body.boxed(), Some(cancel)), move |(mut body, cancel)| {
        let url = url.clone();
        async move {
            let cancel = cancel?;
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = body.next() => Some(item),
            };
            match next {
                None => Some((Err(FetchError::Cancelled { url }), (body, None))),
                Some(item) => item.map(|item| (item, (body, Some(cancel)))),
            }
        }
    })
    .boxed()
}
