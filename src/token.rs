use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt::Display;
use thiserror::Error;

/// Compiled-in first segment, the encoding of `{"alg":"HS256","typ":"JWT"}`.
/// Static from the device point of view, so it is never rebuilt.
const HEADER_B64: &str = "eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9";

/// Longest device identifier the payload template accepts.
pub const MAX_DEVICE_ID_LEN: usize = 64;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("device id exceeds {MAX_DEVICE_ID_LEN} characters")]
    PayloadTooLong,

    #[error("could not key the signing primitive")]
    Signing,
}

/// A short-lived signed credential proving device identity to the job API.
///
/// Three dot-separated base64url segments with no expiry claim, so the
/// value is deterministic for a given device id and secret. Generated
/// fresh for every operation and consumed exactly once when the bearer
/// header is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build the `Authorization` header value, consuming the token.
    pub fn into_bearer(self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Sign a credential for `device_id` with the pre-shared secret.
///
/// The signature covers the exact ASCII bytes of the joined header and
/// payload segments, as the server recomputes it over that substring.
pub(crate) fn generate(device_id: &str, secret: &[u8]) -> Result<Token, TokenError> {
    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(TokenError::PayloadTooLong);
    }

    let payload = format!("{{\"deviceIdentifier\":\"{device_id}\"}}");
    let mut token = format!("{HEADER_B64}.{}", base64_url(payload.as_bytes()));

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::Signing)?;
    mac.update(token.as_bytes());
    let digest = mac.finalize().into_bytes();

    token.push('.');
    token.push_str(&base64_url(&digest));

    Ok(Token(token))
}

/// Standard base64 reshaped for URL use: `+` and `/` are substituted and
/// the output is cut at the first pad character.
pub(crate) fn base64_url(data: &[u8]) -> String {
    let mut encoded = STANDARD.encode(data).replace('+', "-").replace('/', "_");
    if let Some(pad) = encoded.find('=') {
        encoded.truncate(pad);
    }
    encoded
}
