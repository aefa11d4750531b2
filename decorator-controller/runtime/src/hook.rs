use crate::{
    core::{Backoff, HookRequest, HookResponse},
    k8s::decorator::{Hook, InvalidDuration},
};
use bytes::Bytes;
use http::{header, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::time::Duration;
use tokio::time;
use tracing::debug;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Response bodies quoted in errors are truncated to this many characters.
const MAX_ERROR_BODY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid webhook request to {0}: {1}")]
    InvalidRequest(String, #[source] http::Error),

    #[error("invalid webhook timeout: {0}")]
    InvalidTimeout(#[from] InvalidDuration),

    #[error("webhook request failed: {0}")]
    Transport(#[source] BoxError),

    #[error("webhook did not respond within {0:?}")]
    Timeout(Duration),

    #[error("webhook responded with {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("failed to encode webhook request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode webhook response: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Sends a request body to a URL and returns the response status and body.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn post(
        &self,
        url: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<(StatusCode, Bytes), Error>;
}

/// Calls a decorator's sync or finalize hook.
#[async_trait::async_trait]
pub trait SyncHook: Send + Sync + 'static {
    async fn call(&self, hook: &Hook, request: &HookRequest) -> Result<HookResponse, Error>;
}

/// A plain HTTP/1 client.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
}

/// Invokes webhooks with a per-call timeout, retrying transient failures.
#[derive(Clone, Debug)]
pub struct Invoker<T = HttpTransport> {
    transport: T,
    timeout: Duration,
    attempts: u32,
    backoff: Backoff,
}

// === impl Error ===

impl Error {
    /// Timeouts, connection failures and server errors may succeed when
    /// retried. Everything else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

// === impl HttpTransport ===

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<(StatusCode, Bytes), Error> {
        let req = Request::post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(body))
            .map_err(|e| Error::InvalidRequest(url.to_string(), e))?;

        let call = async {
            let rsp = self
                .client
                .request(req)
                .await
                .map_err(|e| Error::Transport(e.into()))?;
            let status = rsp.status();
            let body = rsp
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::Transport(e.into()))?
                .to_bytes();
            Ok((status, body))
        };

        time::timeout(timeout, call)
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }
}

// === impl Invoker ===

impl<T> Invoker<T> {
    /// `timeout` applies to hooks that do not configure their own.
    /// `retries` is the number of additional attempts after a transient
    /// failure.
    pub fn new(transport: T, timeout: Duration, retries: u32, backoff: Backoff) -> Self {
        Self {
            transport,
            timeout,
            attempts: retries.saturating_add(1),
            backoff,
        }
    }
}

#[async_trait::async_trait]
impl<T: Transport> SyncHook for Invoker<T> {
    async fn call(&self, hook: &Hook, request: &HookRequest) -> Result<HookResponse, Error> {
        let url = hook.webhook.url.as_str();
        let timeout = hook.webhook.timeout()?.unwrap_or(self.timeout);
        let body = Bytes::from(serde_json::to_vec(request).map_err(Error::Encode)?);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.transport.post(url, body.clone(), timeout).await {
                Ok((status, body)) if status.is_success() => {
                    return serde_json::from_slice(&body).map_err(Error::Decode);
                }
                Ok((status, body)) => Error::Status {
                    status,
                    body: String::from_utf8_lossy(&body)
                        .chars()
                        .take(MAX_ERROR_BODY)
                        .collect(),
                },
                Err(error) => error,
            };

            if !error.is_transient() || attempt >= self.attempts {
                return Err(error);
            }
            let delay = self.backoff.delay(attempt);
            debug!(%error, %url, attempt, ?delay, "Retrying webhook");
            time::sleep(delay).await;
        }
    }
}
