//! Signed access keys handed out to allow-listed users.
//!
//! An access key is `base64(user_id + ":" + base64(HMAC-SHA256(secret, user_id)))`.
//! The server keeps no record of issued keys: validity is decided purely by
//! recomputing the signature with the process-wide secret.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const SEPARATOR: char = ':';

/// Errors produced while issuing or checking an access key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessKeyError {
    #[error("user id is empty")]
    EmptyIdentity,

    #[error("signing key rejected by HMAC")]
    InvalidSecret,

    #[error("access key is not valid base64")]
    MalformedToken,

    #[error("invalid access key format")]
    InvalidFormat,

    #[error("access key signature is not valid base64")]
    MalformedSignature,

    #[error("signature mismatch")]
    SignatureMismatch,
}

impl AccessKeyError {
    /// `true` when the key could not even be decoded into `user:signature`.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedToken | Self::InvalidFormat | Self::MalformedSignature
        )
    }
}

/// Issues and verifies access keys with a single shared secret.
///
/// Cheap to clone; the secret is immutable once the codec is built.
#[derive(Clone)]
pub struct AccessKeyCodec {
    secret: Vec<u8>,
}

impl std::fmt::Debug for AccessKeyCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessKeyCodec")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl AccessKeyCodec {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Issue an access key for `user_id`.
    pub fn generate(&self, user_id: &str) -> Result<String, AccessKeyError> {
        if user_id.is_empty() {
            return Err(AccessKeyError::EmptyIdentity);
        }

        let signature = self.sign(user_id)?;
        let payload = format!("{user_id}{SEPARATOR}{}", BASE64.encode(signature));
        Ok(BASE64.encode(payload))
    }

    /// Verify `access_key` and return the user id it was issued for.
    pub fn parse(&self, access_key: &str) -> Result<String, AccessKeyError> {
        let raw = BASE64
            .decode(access_key)
            .map_err(|_| AccessKeyError::MalformedToken)?;
        let payload = String::from_utf8(raw).map_err(|_| AccessKeyError::MalformedToken)?;

        let parts: Vec<&str> = payload.split(SEPARATOR).collect();
        let [user_id, encoded_sig] = parts.as_slice() else {
            return Err(AccessKeyError::InvalidFormat);
        };

        let provided = BASE64
            .decode(encoded_sig)
            .map_err(|_| AccessKeyError::MalformedSignature)?;

        let mut mac = self.mac()?;
        mac.update(user_id.as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| AccessKeyError::SignatureMismatch)?;

        Ok((*user_id).to_string())
    }

    fn sign(&self, user_id: &str) -> Result<Vec<u8>, AccessKeyError> {
        let mut mac = self.mac()?;
        mac.update(user_id.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn mac(&self) -> Result<HmacSha256, AccessKeyError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| AccessKeyError::InvalidSecret)
    }
}

/// Issue an access key for `user_id` signed with `secret`.
pub fn generate(user_id: &str, secret: &str) -> Result<String, AccessKeyError> {
    AccessKeyCodec::new(secret).generate(user_id)
}

/// Verify `access_key` against `secret` and return its user id.
pub fn parse(access_key: &str, secret: &str) -> Result<String, AccessKeyError> {
    AccessKeyCodec::new(secret).parse(access_key)
}
