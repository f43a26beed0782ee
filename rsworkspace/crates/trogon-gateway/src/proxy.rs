//! Forwards authorized requests to the upstream completion API.
//!
//! The inbound body is buffered, the request is re-issued against the single
//! configured upstream URL with the gateway's own API key, and the upstream
//! response is streamed back to the caller untouched.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use reqwest::Url;
use thiserror::Error;

use crate::error::json_error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid upstream URL '{url}': {reason}")]
    InvalidTargetUrl { url: String, reason: String },

    #[error("Upstream API key is not a valid header value")]
    InvalidApiKey,

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Failed to read request body: {0}")]
    BodyRead(String),

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            Self::UpstreamUnreachable(_) => {
                tracing::error!(error = %self, "Proxy request failed");
                json_error(StatusCode::BAD_GATEWAY, "proxy request failed")
            }
            Self::BodyRead(_) => {
                tracing::warn!(error = %self, "Could not read inbound body");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "read request body failed")
            }
            _ => {
                tracing::error!(error = %self, "Proxy misconfigured");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

/// Re-issues requests against one fixed upstream URL.
///
/// Cloning is cheap: `reqwest::Client` shares its connection pool.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    target: Url,
    authorization: HeaderValue,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("target", &self.target.as_str())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Forwarder {
    pub fn new(target_url: &str, api_key: &str) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(ProxyError::Client)?;
        Self::with_client(client, target_url, api_key)
    }

    pub fn with_client(
        client: reqwest::Client,
        target_url: &str,
        api_key: &str,
    ) -> Result<Self, ProxyError> {
        let target = Url::parse(target_url).map_err(|e| ProxyError::InvalidTargetUrl {
            url: target_url.to_string(),
            reason: e.to_string(),
        })?;

        let mut authorization = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProxyError::InvalidApiKey)?;
        authorization.set_sensitive(true);

        Ok(Self {
            client,
            target,
            authorization,
            timeout: None,
        })
    }

    /// Give up on the upstream if it has not sent response headers within `timeout`.
    /// The body stream itself is never cut short.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> &str {
        self.target.as_str()
    }

    /// Buffer the inbound body and forward the whole request upstream.
    pub async fn forward_request(&self, request: Request) -> Result<reqwest::Response, ProxyError> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| ProxyError::BodyRead(e.to_string()))?;
        self.forward(parts.method, &parts.headers, body).await
    }

    /// Send `method` + `body` to the upstream URL with the caller's headers,
    /// replacing `Authorization` with the upstream API key.
    pub async fn forward(
        &self,
        method: Method,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, ProxyError> {
        let send = self
            .client
            .request(method, self.target.clone())
            .headers(self.outbound_headers(headers))
            .body(body)
            .send();

        let result = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, send).await.map_err(|_| {
                ProxyError::UpstreamUnreachable(format!("no response within {timeout:?}"))
            })?,
            None => send.await,
        };

        let upstream = result.map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;
        tracing::debug!(status = upstream.status().as_u16(), "Upstream responded");
        Ok(upstream)
    }

    fn outbound_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut headers = inbound.clone();
        // Framing and host belong to the new connection and the buffered body.
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);
        headers.insert(AUTHORIZATION, self.authorization.clone());
        headers
    }
}

/// Turn the upstream response into the client response: same status, same
/// headers, body streamed through chunk by chunk.
///
/// The upstream body is released when the stream finishes or when the client
/// response is dropped.
pub fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = upstream.headers().clone();

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
