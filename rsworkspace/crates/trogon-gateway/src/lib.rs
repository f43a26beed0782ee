//! # trogon-gateway
//!
//! Access-key gateway in front of an OpenAI-compatible chat completion API.
//!
//! ## How it works
//!
//! ```text
//! Client → POST /api/v1/get_access_key {"userId":"alice"}
//!          ← 200 {"access_key":"<base64 of alice:<base64 HMAC-SHA256>>"}
//!
//! Client → POST /api/v1/chat/completions
//!          Authorization: Bearer <access_key>
//!               ↓
//!          [require_access_key]  signature → allow-list → blacklist → rate limit
//!               ↓
//!          [Forwarder]  same method/body/headers, Authorization: Bearer <upstream key>
//!               ↓
//!          upstream API  → status, headers and body streamed back verbatim
//! ```
//!
//! Access keys never expire: they stay valid for as long as the signing secret
//! is unchanged. Rate limiting is a fixed window per user, in process memory.
//!
//! ## Configuration
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `CONFIG_PATH` | `config.json` | JSON config file (see [`GatewayConfig`]) |
//! | `GATEWAY_PORT` | `8080` | HTTP listening port |
//! | `RUST_LOG` | `info` | Log filter (tracing-subscriber) |

pub mod access_key;
pub mod access_list;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod proxy;
pub mod rate_limit;
pub mod server;

pub use access_key::{AccessKeyCodec, AccessKeyError};
pub use access_list::{AccessList, Denial};
pub use config::{ConfigError, GatewayConfig};
pub use error::ServeError;
pub use gateway::{Gatekeeper, GatewayError};
pub use proxy::{Forwarder, ProxyError};
pub use rate_limit::{BucketStore, MemoryBucketStore, RateBucket, RateLimiter};
pub use server::{AppState, router, serve};
