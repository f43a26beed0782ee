//! Access-key authorization in front of the proxied routes.
//!
//! Checks run in a fixed order and the first failure ends the request:
//!
//! 1. `Authorization` header present (`Bearer ` prefix optional) → else 401
//! 2. access key signature valid → else 401
//! 3. user on the allow-list → else 403
//! 4. user not on the blacklist → else 403
//! 5. user still has quota in the current window → else 429

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, warn};

use crate::access_key::{AccessKeyCodec, AccessKeyError};
use crate::access_list::{AccessList, Denial};
use crate::error::json_error;
use crate::proxy::ProxyError;
use crate::rate_limit::RateLimiter;

const BEARER_PREFIX: &str = "bearer ";

/// Every way a gateway request can be refused.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing access key")]
    MissingToken,

    #[error("invalid access key")]
    InvalidToken(#[source] AccessKeyError),

    #[error("{}", .0.message())]
    Forbidden(Denial),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("{0}")]
    BadRequest(&'static str),

    #[error("generate access key failed")]
    IssueFailed(#[source] AccessKeyError),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::IssueFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Proxy(ProxyError::UpstreamUnreachable(_)) => StatusCode::BAD_GATEWAY,
            Self::Proxy(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            Self::Proxy(err) => err.into_response(),
            other => json_error(other.status(), other.to_string()),
        }
    }
}

/// User id the request was authorized as; inserted into request extensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Issues access keys and authorizes requests carrying them.
pub struct Gatekeeper {
    codec: AccessKeyCodec,
    access_list: AccessList,
    limiter: RateLimiter,
}

impl Gatekeeper {
    pub fn new(codec: AccessKeyCodec, access_list: AccessList, limiter: RateLimiter) -> Self {
        Self {
            codec,
            access_list,
            limiter,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Hand out an access key to an allow-listed, non-blacklisted user.
    pub fn issue(&self, user_id: &str) -> Result<String, GatewayError> {
        if user_id.trim().is_empty() {
            return Err(GatewayError::BadRequest("userId is required"));
        }
        if let Err(denial) = self.access_list.check(user_id) {
            warn!(user_id, reason = denial.message(), "Access key refused");
            return Err(GatewayError::Forbidden(denial));
        }
        let key = self
            .codec
            .generate(user_id)
            .map_err(GatewayError::IssueFailed)?;
        debug!(user_id, "Access key issued");
        Ok(key)
    }

    /// Run the full check chain and return the caller's user id.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<String, GatewayError> {
        let access_key = bearer_token(headers).ok_or(GatewayError::MissingToken)?;

        let user_id = self.codec.parse(access_key).map_err(|e| {
            warn!(error = %e, "Rejected access key");
            GatewayError::InvalidToken(e)
        })?;

        if let Err(denial) = self.access_list.check(&user_id) {
            warn!(user_id = %user_id, reason = denial.message(), "Request refused");
            return Err(GatewayError::Forbidden(denial));
        }

        if !self.limiter.allow(&user_id) {
            warn!(user_id = %user_id, "Rate limit exceeded");
            return Err(GatewayError::RateLimited);
        }

        debug!(user_id = %user_id, "Request authorized");
        Ok(user_id)
    }
}

/// Extract the access key from `Authorization`, with or without a
/// case-insensitive `Bearer ` prefix. `None` when absent or blank.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = match value.get(..BEARER_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(BEARER_PREFIX) => {
            value[BEARER_PREFIX.len()..].trim()
        }
        _ => value,
    };
    (!token.is_empty()).then_some(token)
}

/// axum middleware: authorize the request or answer with the refusal.
pub async fn require_access_key(
    State(gatekeeper): State<Arc<Gatekeeper>>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let user_id = gatekeeper.authorize(request.headers())?;
    request.extensions_mut().insert(AuthenticatedUser(user_id));
    Ok(next.run(request).await)
}
