/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Bearer-token verification: compact HS256 JWTs
//! (`base64url(header).base64url(claims).base64url(hmac)`), checked against
//! the configured symmetric secret. The subject claim is the user identity
//! every authorization decision keys on.

use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use types::Timestamp;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("malformed token")]
    Malformed,

    #[error("bad signature")]
    BadSignature,

    #[error("token expired")]
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// The user id.
    pub sub: String,
    /// Expiry, seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Issued-at, seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl Claims {
    pub fn for_user(user: &str) -> Self {
        Self {
            sub: user.to_string(),
            exp: None,
            iat: Some(Timestamp::now().as_millis_i64() / 1000),
        }
    }
}

const HEADER_JSON: &[u8] = br#"{"alg":"HS256","typ":"JWT"}"#;

fn mac_for(secret: &[u8], signing_input: &[u8]) -> Result<HmacSha256, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthError::Malformed)?;
    mac.update(signing_input);
    Ok(mac)
}

/// Mint a token. The server only verifies; this exists for tests and
/// provisioning tooling.
pub fn encode_token(secret: &[u8], claims: &Claims) -> Result<String, AuthError> {
    let header = BASE64_URL_SAFE_NO_PAD.encode(HEADER_JSON);
    let claims = serde_json::to_vec(claims).map_err(|_| AuthError::Malformed)?;
    let payload = BASE64_URL_SAFE_NO_PAD.encode(claims);
    let signing_input = format!("{}.{}", header, payload);
    let mac = mac_for(secret, signing_input.as_bytes())?;
    let signature = BASE64_URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{}.{}", signing_input, signature))
}

/// Verify `token` and return its claims.
pub fn verify_token(secret: &[u8], token: &str) -> Result<Claims, AuthError> {
    let mut parts = token.splitn(3, '.');
    let (header, payload, signature) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s)) if !h.is_empty() && !p.is_empty() && !s.is_empty() => (h, p, s),
        _ => return Err(AuthError::Malformed),
    };

    let signing_input = format!("{}.{}", header, payload);
    let signature = BASE64_URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| AuthError::Malformed)?;
    mac_for(secret, signing_input.as_bytes())?
        .verify_slice(&signature)
        .map_err(|_| AuthError::BadSignature)?;

    // Only look inside once the signature holds.
    let header_bytes = BASE64_URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|_| AuthError::Malformed)?;
    let header_json: serde_json::Value =
        serde_json::from_slice(&header_bytes).map_err(|_| AuthError::Malformed)?;
    if header_json.get("alg").and_then(|v| v.as_str()) != Some("HS256") {
        return Err(AuthError::Malformed);
    }

    let claims_bytes = BASE64_URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::Malformed)?;
    let claims: Claims = serde_json::from_slice(&claims_bytes).map_err(|_| AuthError::Malformed)?;
    if claims.sub.is_empty() {
        return Err(AuthError::Malformed);
    }
    if let Some(exp) = claims.exp {
        if exp * 1000 < Timestamp::now().as_millis_i64() {
            return Err(AuthError::Expired);
        }
    }
    Ok(claims)
}
