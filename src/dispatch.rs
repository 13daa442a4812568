//! Backend selection and forwarding.
//!
//! Every call walks the registry's candidates in priority order. A transport
//! failure (refused, reset, timed out) moves on to the next backend; any HTTP
//! response at all, error statuses included, ends the walk. The caller decides
//! what a non-2xx status means.

use std::error::Error as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, Method};
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::logging::{LogLevel, SharedLogger};
use crate::registry::{BackendRegistry, Candidate};
use crate::translate::request::ProxyRequest;

/// Headers that never travel from the client to a backend.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "accept-encoding",
    "authorization",
];

pub(crate) fn should_forward_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !HOP_BY_HOP_HEADERS.contains(&lower.as_str())
}

/// Why one attempt against one backend failed before any response arrived.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Transport(String),
}

impl AttemptError {
    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            AttemptError::Timeout(timeout)
        } else {
            AttemptError::Transport(describe(&err))
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AttemptError::Timeout(_))
    }
}

/// reqwest's top-level message hides the useful part ("connection refused") in the source chain.
fn describe(err: &reqwest::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        msg.push_str(": ");
        msg.push_str(&inner.to_string());
        source = inner.source();
    }
    msg
}

/// A fully buffered backend response.
#[derive(Debug)]
pub struct BackendReply {
    pub candidate: Candidate,
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: Bytes,
}

impl BackendReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&HeaderValue> {
        self.headers.get(CONTENT_TYPE)
    }
}

/// A backend response whose headers have arrived and whose body is still on the wire.
#[derive(Debug)]
pub struct OpenResponse {
    pub candidate: Candidate,
    pub response: reqwest::Response,
}

pub struct Dispatcher {
    client: reqwest::Client,
    registry: Arc<BackendRegistry>,
    logger: SharedLogger,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client, registry: Arc<BackendRegistry>, logger: SharedLogger) -> Self {
        Self {
            client,
            registry,
            logger,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Forward a translated, non-streaming request and buffer the reply.
    pub async fn send(&self, req: &ProxyRequest, headers: &HeaderMap) -> Result<BackendReply> {
        let body = Bytes::from(req.body_bytes()?);
        self.fetch(
            &req.request_id,
            Method::POST,
            req.endpoint.path(),
            headers,
            Some(body),
        )
        .await
    }

    /// Issue a request and buffer the reply, falling back across backends.
    ///
    /// The backend's timeout covers both the response headers and the body.
    pub async fn fetch(
        &self,
        request_id: &str,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<BackendReply> {
        let (candidate, (status, resp_headers, bytes)) = self
            .with_fallback(request_id, path_and_query, |candidate| {
                let builder = self.build(
                    &candidate,
                    method.clone(),
                    path_and_query,
                    headers,
                    request_id,
                    body.clone(),
                );
                let timeout = candidate.backend.timeout;
                async move {
                    let exchange = async {
                        let resp = builder.send().await?;
                        let status = resp.status().as_u16();
                        let headers = resp.headers().clone();
                        let bytes = resp.bytes().await?;
                        Ok::<_, reqwest::Error>((status, headers, bytes))
                    };
                    match tokio::time::timeout(timeout, exchange).await {
                        Ok(Ok(v)) => Ok(v),
                        Ok(Err(e)) => Err(AttemptError::from_reqwest(e, timeout)),
                        Err(_) => Err(AttemptError::Timeout(timeout)),
                    }
                }
            })
            .await?;

        debug!(
            request_id,
            backend = %candidate.backend.name,
            status,
            body_len = bytes.len(),
            "Backend replied"
        );

        Ok(BackendReply {
            candidate,
            status,
            headers: resp_headers,
            body: bytes,
        })
    }

    /// Forward a translated streaming request, returning once response headers arrive.
    ///
    /// Fallback is only possible up to this point; once the body starts
    /// flowing to the client the choice of backend is final.
    pub async fn open_stream(&self, req: &ProxyRequest, headers: &HeaderMap) -> Result<OpenResponse> {
        let body = Bytes::from(req.body_bytes()?);
        self.open(
            &req.request_id,
            Method::POST,
            req.endpoint.path(),
            headers,
            Some(body),
        )
        .await
    }

    /// Issue a request and hand back the unread response, falling back across backends.
    ///
    /// The backend's timeout covers the wait for response headers only.
    pub async fn open(
        &self,
        request_id: &str,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<OpenResponse> {
        let (candidate, response) = self
            .with_fallback(request_id, path_and_query, |candidate| {
                let builder = self.build(
                    &candidate,
                    method.clone(),
                    path_and_query,
                    headers,
                    request_id,
                    body.clone(),
                );
                let timeout = candidate.backend.timeout;
                async move {
                    match tokio::time::timeout(timeout, builder.send()).await {
                        Ok(Ok(resp)) => Ok(resp),
                        Ok(Err(e)) => Err(AttemptError::from_reqwest(e, timeout)),
                        Err(_) => Err(AttemptError::Timeout(timeout)),
                    }
                }
            })
            .await?;

        debug!(
            request_id,
            backend = %candidate.backend.name,
            status = response.status().as_u16(),
            "Backend response headers received"
        );

        Ok(OpenResponse {
            candidate,
            response,
        })
    }

    fn build(
        &self,
        candidate: &Candidate,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        request_id: &str,
        body: Option<Bytes>,
    ) -> reqwest::RequestBuilder {
        let url = candidate.backend.url_for(path_and_query);
        let mut forwarded = HeaderMap::new();
        for (name, value) in headers {
            if should_forward_header(name.as_str()) && name.as_str() != "x-request-id" {
                forwarded.append(name.clone(), value.clone());
            }
        }

        let mut builder = self.client.request(method, url).headers(forwarded);
        if let Some(key) = candidate.backend.api_key() {
            builder = builder.bearer_auth(key);
        }
        builder = builder.header("x-request-id", request_id);
        if let Some(body) = body {
            if !headers.contains_key(CONTENT_TYPE) {
                builder = builder.header(CONTENT_TYPE, "application/json");
            }
            builder = builder.body(body);
        }
        builder
    }

    async fn with_fallback<T, F, Fut>(
        &self,
        request_id: &str,
        path: &str,
        mut attempt: F,
    ) -> Result<(Candidate, T)>
    where
        F: FnMut(Candidate) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let candidates = self.registry.candidates();
        let mut failures = Vec::with_capacity(candidates.len());
        let mut all_timed_out = true;

        for candidate in candidates {
            debug!(request_id, backend = %candidate.backend.name, path, "Trying backend");

            match attempt(candidate.clone()).await {
                Ok(value) => {
                    self.registry.record_success(candidate.slot);
                    return Ok((candidate, value));
                }
                Err(err) => {
                    warn!(
                        request_id,
                        backend = %candidate.backend.name,
                        error = %err,
                        "Backend attempt failed, trying next"
                    );
                    self.registry.record_failure(candidate.slot, err.to_string());
                    self.logger.request(
                        LogLevel::Warn,
                        "dispatch",
                        request_id,
                        format!("{} {} failed: {}", candidate.backend.name, path, err),
                    );
                    all_timed_out &= err.is_timeout();
                    failures.push(format!("{}: {}", candidate.backend.name, err));
                }
            }
        }

        self.logger.request(
            LogLevel::Error,
            "dispatch",
            request_id,
            format!("All backends failed for {path}"),
        );
        Err(GatewayError::unavailable(
            format!("all backends failed ({})", failures.join("; ")),
            all_timed_out && !failures.is_empty(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_forward_header() {
        assert!(should_forward_header("accept"));
        assert!(should_forward_header("content-type"));
        assert!(should_forward_header("x-custom-header"));

        assert!(!should_forward_header("Connection"));
        assert!(!should_forward_header("host"));
        assert!(!should_forward_header("authorization"));
        assert!(!should_forward_header("transfer-encoding"));
        assert!(!should_forward_header("accept-encoding"));
    }

    #[test]
    fn test_attempt_error_timeout_flag() {
        assert!(AttemptError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(!AttemptError::Transport("refused".into()).is_timeout());
    }
}
