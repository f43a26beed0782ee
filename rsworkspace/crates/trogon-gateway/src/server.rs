use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{any, post};
use axum::{Extension, Json, Router, middleware};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, instrument, warn};

use crate::access_key::AccessKeyCodec;
use crate::access_list::AccessList;
use crate::config::GatewayConfig;
use crate::error::ServeError;
use crate::gateway::{AuthenticatedUser, Gatekeeper, GatewayError, require_access_key};
use crate::proxy::{Forwarder, ProxyError, relay};
use crate::rate_limit::RateLimiter;

pub const HEALTH_PATH: &str = "/healthz";
pub const ACCESS_KEY_PATH: &str = "/api/v1/get_access_key";
pub const CHAT_COMPLETIONS_PATH: &str = "/api/v1/chat/completions";

#[derive(Clone)]
pub struct AppState {
    pub gatekeeper: Arc<Gatekeeper>,
    pub forwarder: Forwarder,
}

impl AppState {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, ProxyError> {
        let forwarder = Forwarder::new(&config.openai.target_url, &config.openai.api_key)?
            .with_timeout(config.openai.timeout());

        let gatekeeper = Gatekeeper::new(
            AccessKeyCodec::new(&config.service.secret_key),
            AccessList::new(&config.service.users, &config.service.blacklist),
            RateLimiter::new(
                config.rate_limit.capacity(),
                config.rate_limit.refill_interval(),
            ),
        );

        Ok(Self {
            gatekeeper: Arc::new(gatekeeper),
            forwarder,
        })
    }
}

const USER_ID_FIELD: &str = "userId";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct AccessKeyRequest {
    pub user_id: String,
}

impl AccessKeyRequest {
    /// Decode a request body. `userId` is matched case-insensitively, with an
    /// exact match taking precedence; a missing or null value reads as empty.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        let fields: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(body)?;
        let value = fields.get(USER_ID_FIELD).or_else(|| {
            fields
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(USER_ID_FIELD))
                .map(|(_, value)| value)
        });

        let user_id = match value {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(value) => serde_json::from_value(value.clone())?,
        };
        Ok(Self { user_id })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessKeyResponse {
    pub access_key: String,
}

/// Build the gateway router.
///
/// Wrong methods are answered with 405 before authorization runs, so they
/// never consume rate-limit quota.
pub fn router(state: AppState) -> Router {
    let auth = middleware::from_fn_with_state(state.gatekeeper.clone(), require_access_key);

    Router::new()
        .route(HEALTH_PATH, any(healthz))
        .route(
            ACCESS_KEY_PATH,
            post(get_access_key).fallback(method_not_allowed),
        )
        .route(
            CHAT_COMPLETIONS_PATH,
            post(chat_completions)
                .fallback(method_not_allowed)
                .route_layer(auth),
        )
        .with_state(state)
}

/// Starts the gateway HTTP server and runs until Ctrl-C / SIGTERM.
pub async fn serve(config: GatewayConfig) -> Result<(), ServeError> {
    if config.service.secret_key.is_empty() {
        warn!("service.secret_key is empty; access keys are signed with an empty key");
    }

    let state = AppState::from_config(&config)?;

    let sweeper = config
        .rate_limit
        .sweep_interval()
        .map(|every| spawn_bucket_sweeper(state.gatekeeper.clone(), every));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    info!(
        addr = %addr,
        upstream = state.forwarder.target(),
        capacity = config.rate_limit.capacity(),
        refill_interval_secs = config.rate_limit.refill_interval().as_secs(),
        users = config.service.users.len(),
        blacklisted = config.service.blacklist.len(),
        "Gateway listening"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    info!("Gateway stopped");
    Ok(())
}

/// Periodically drop rate-limit buckets whose window has run out.
pub fn spawn_bucket_sweeper(gatekeeper: Arc<Gatekeeper>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            gatekeeper.limiter().evict_idle();
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn healthz() -> &'static str {
    "ok"
}

async fn method_not_allowed() -> GatewayError {
    GatewayError::MethodNotAllowed
}

#[instrument(name = "gateway.get_access_key", skip_all)]
async fn get_access_key(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<AccessKeyResponse>, GatewayError> {
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| {
            warn!(error = %e, "Could not read access key request");
            GatewayError::BadRequest("invalid request body")
        })?;
    let request = AccessKeyRequest::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Unparsable access key request");
        GatewayError::BadRequest("invalid request body")
    })?;

    let access_key = state.gatekeeper.issue(&request.user_id)?;
    info!(user_id = %request.user_id, "Access key issued");
    Ok(Json(AccessKeyResponse { access_key }))
}

#[instrument(
    name = "gateway.chat_completions",
    skip_all,
    fields(user_id = tracing::field::Empty)
)]
async fn chat_completions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    request: Request,
) -> Result<Response, GatewayError> {
    tracing::Span::current().record("user_id", user.0.as_str());

    let upstream = state.forwarder.forward_request(request).await?;
    let status = upstream.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        warn!(status = status.as_u16(), "Upstream returned an error status; relaying as-is");
    }
    Ok(relay(upstream))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, header};
    use tower::ServiceExt as _;

    use super::*;
    use crate::error::ErrorBody;

    const SECRET: &str = "s3cr3t";

    fn config(capacity: i64) -> GatewayConfig {
        GatewayConfig::from_json(&format!(
            r#"{{
                "service": {{ "secret_key": "{SECRET}", "users": ["alice", "mallory"], "blacklist": ["mallory"] }},
                "openai": {{ "target_url": "http://127.0.0.1:1/v1/chat/completions", "api_key": "sk-upstream" }},
                "rate_limit": {{ "capacity": {capacity}, "refill_interval_second": 60 }}
            }}"#
        ))
        .unwrap()
    }

    fn app(capacity: i64) -> Router {
        router(AppState::from_config(&config(capacity)).unwrap())
    }

    fn access_key_request(method: Method, body: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(ACCESS_KEY_PATH)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn error_of(resp: Response) -> String {
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice::<ErrorBody>(&body).unwrap().error
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let resp = app(1)
            .oneshot(Request::builder().uri(HEALTH_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn get_access_key_issues_verifiable_key() {
        let resp = app(1)
            .oneshot(access_key_request(Method::POST, r#"{"userId":"alice"}"#))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let issued: AccessKeyResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            AccessKeyCodec::new(SECRET).parse(&issued.access_key).unwrap(),
            "alice"
        );
    }

    #[tokio::test]
    async fn get_access_key_for_unlisted_user_is_403() {
        let resp = app(1)
            .oneshot(access_key_request(Method::POST, r#"{"userId":"eve"}"#))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(error_of(resp).await, "user not allowed");
    }

    #[tokio::test]
    async fn get_access_key_for_blacklisted_user_is_403() {
        let resp = app(1)
            .oneshot(access_key_request(Method::POST, r#"{"userId":"mallory"}"#))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(error_of(resp).await, "user in blacklist");
    }

    #[tokio::test]
    async fn get_access_key_with_bad_json_is_400() {
        let resp = app(1)
            .oneshot(access_key_request(Method::POST, "{userId:"))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_of(resp).await, "invalid request body");
    }

    #[tokio::test]
    async fn get_access_key_with_blank_user_is_400() {
        for body in [r#"{"userId":"   "}"#, "{}"] {
            let resp = app(1)
                .oneshot(access_key_request(Method::POST, body))
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body {body}");
            assert_eq!(error_of(resp).await, "userId is required");
        }
    }

    #[tokio::test]
    async fn get_access_key_with_get_is_405() {
        let resp = app(1)
            .oneshot(access_key_request(Method::GET, ""))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(error_of(resp).await, "method not allowed");
    }

    #[tokio::test]
    async fn chat_completions_without_authorization_is_401() {
        let request = Request::builder()
            .method(Method::POST)
            .uri(CHAT_COMPLETIONS_PATH)
            .body(Body::from("{}"))
            .unwrap();

        let resp = app(1).oneshot(request).await.unwrap();

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_of(resp).await, "missing access key");
    }

    #[tokio::test]
    async fn chat_completions_with_wrong_method_is_405_and_consumes_no_quota() {
        let state = AppState::from_config(&config(1)).unwrap();
        let gatekeeper = state.gatekeeper.clone();
        let key = AccessKeyCodec::new(SECRET).generate("alice").unwrap();

        let request = Request::builder()
            .method(Method::GET)
            .uri(CHAT_COMPLETIONS_PATH)
            .header(header::AUTHORIZATION, format!("Bearer {key}"))
            .body(Body::empty())
            .unwrap();

        let resp = router(state).oneshot(request).await.unwrap();

        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(error_of(resp).await, "method not allowed");
        assert_eq!(gatekeeper.limiter().tracked(), 0);
    }

    #[tokio::test]
    async fn chat_completions_with_unreachable_upstream_is_502() {
        let key = AccessKeyCodec::new(SECRET).generate("alice").unwrap();
        let request = Request::builder()
            .method(Method::POST)
            .uri(CHAT_COMPLETIONS_PATH)
            .header(header::AUTHORIZATION, format!("Bearer {key}"))
            .body(Body::from("{}"))
            .unwrap();

        let resp = app(5).oneshot(request).await.unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(error_of(resp).await, "proxy request failed");
    }

    #[test]
    fn invalid_upstream_url_fails_state_construction() {
        let mut config = config(1);
        config.openai.target_url = "::not a url::".to_string();
        assert!(matches!(
            AppState::from_config(&config),
            Err(ProxyError::InvalidTargetUrl { .. })
        ));
    }

    #[tokio::test]
    async fn healthz_answers_any_method() {
        for method in [Method::POST, Method::HEAD, Method::DELETE] {
            let request = Request::builder()
                .method(method.clone())
                .uri(HEALTH_PATH)
                .body(Body::empty())
                .unwrap();

            let resp = app(1).oneshot(request).await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK, "method {method}");
        }
    }

    #[tokio::test]
    async fn get_access_key_accepts_body_larger_than_default_limit() {
        let body = format!(r#"{{"userId":"alice","pad":"{}"}}"#, "x".repeat(3 * 1024 * 1024));

        let resp = app(1)
            .oneshot(access_key_request(Method::POST, &body))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let issued: AccessKeyResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            AccessKeyCodec::new(SECRET).parse(&issued.access_key).unwrap(),
            "alice"
        );
    }

    #[tokio::test]
    async fn get_access_key_matches_user_id_field_case_insensitively() {
        for body in [r#"{"UserId":"alice"}"#, r#"{"userid":"alice"}"#, r#"{"USERID":"alice"}"#] {
            let resp = app(1)
                .oneshot(access_key_request(Method::POST, body))
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::OK, "body {body}");
        }
    }

    #[tokio::test]
    async fn get_access_key_with_non_string_user_id_is_400() {
        let resp = app(1)
            .oneshot(access_key_request(Method::POST, r#"{"userId":42}"#))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_of(resp).await, "invalid request body");
    }

    #[test]
    fn access_key_request_prefers_exact_field_name() {
        let request =
            AccessKeyRequest::from_slice(br#"{"USERID":"bob","userId":"alice"}"#).unwrap();
        assert_eq!(request.user_id, "alice");

        let request = AccessKeyRequest::from_slice(br#"{"userId":null}"#).unwrap();
        assert_eq!(request.user_id, "");
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_expired_buckets() {
        let state = AppState::from_config(&config(1)).unwrap();
        let gatekeeper = state.gatekeeper.clone();
        assert!(gatekeeper.limiter().allow("alice"));

        let sweeper = spawn_bucket_sweeper(gatekeeper.clone(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(91)).await;

        assert_eq!(gatekeeper.limiter().tracked(), 0);
        sweeper.abort();
    }
}
