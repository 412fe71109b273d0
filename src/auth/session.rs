//! C3 — Session Token Engine.
//!
//! Issues, validates, and refreshes stateless HMAC-SHA256-signed session
//! artifacts. All session state rides in the signed token; nothing is kept
//! server-side.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AuthError;
use crate::config::JwtConfig;

/// The session artifact's `token_type` discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Short-lived, single-use; exchanged at `/bearer-auth`.
    Bootstrap,
    /// Long-lived; re-validated on every `/verify` call.
    Session,
}

/// A principal snapshot embedded in a session artifact at issuance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub uid: String,
    pub username: String,
    pub groups: Vec<String>,
    pub extra: HashMap<String, Vec<String>>,
}

/// The decoded claims of a session artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,

    pub user: String,
    pub groups: Vec<String>,
    pub uid: String,
    #[serde(default)]
    pub extra: HashMap<String, Vec<String>>,

    pub path: String,
    pub domain: String,
    pub token_type: TokenType,
    #[serde(default)]
    pub skip_refresh: bool,
}

/// Only HMAC algorithms may ever sign or verify a session artifact. A token
/// claiming `alg: none` or an asymmetric algorithm is rejected before
/// signature verification runs.
fn is_algorithm_allowed(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

const CLOCK_SKEW_LEEWAY_SECS: u64 = 5;

pub struct SessionEngine {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    expiration_secs: i64,
    refresh_enable: bool,
    refresh_window_secs: i64,
    refresh_horizon_secs: i64,
}

impl SessionEngine {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.signing_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.signing_key.as_bytes()),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            expiration_secs: config.expiration_secs,
            refresh_enable: config.refresh_enable,
            refresh_window_secs: config.refresh_window_secs,
            refresh_horizon_secs: config.refresh_horizon_secs,
        }
    }

    /// Mints a fresh signed artifact for `principal`, scoped to `path`/`domain`.
    pub fn generate(
        &self,
        principal: &Principal,
        path: &str,
        domain: &str,
        token_type: TokenType,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = SessionClaims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: principal.username.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + chrono::Duration::seconds(self.expiration_secs)).timestamp(),
            user: principal.username.clone(),
            groups: principal.groups.clone(),
            uid: principal.uid.clone(),
            extra: principal.extra.clone(),
            path: path.to_string(),
            domain: domain.to_string(),
            token_type,
            skip_refresh: false,
        };
        self.sign(&claims)
    }

    fn sign(&self, claims: &SessionClaims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("failed to sign session artifact: {e}")))
    }

    /// Validates a signed artifact, enforcing the HMAC allowlist, configured
    /// `iss`/`aud`, and a 5-second clock-skew leeway.
    pub fn validate(&self, token: &str) -> Result<SessionClaims, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::ClaimsInvalid(format!("malformed header: {e}")))?;

        if !is_algorithm_allowed(header.alg) {
            return Err(AuthError::SignatureInvalid);
        }

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.leeway = CLOCK_SKEW_LEEWAY_SECS;

        match decode::<SessionClaims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(AuthError::TokenExpired),
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    Err(AuthError::SignatureInvalid)
                }
                _ => Err(AuthError::ClaimsInvalid(e.to_string())),
            },
        }
    }

    /// Re-signs `claims` with a new `nbf`/`exp`, preserving the original
    /// `iat` so the refresh horizon stays anchored to first issuance.
    pub fn refresh(&self, claims: &SessionClaims) -> Result<String, AuthError> {
        let now = Utc::now();
        let mut next = claims.clone();
        next.nbf = now.timestamp();
        next.exp = (now + chrono::Duration::seconds(self.expiration_secs)).timestamp();
        self.sign(&next)
    }

    /// Re-signs `claims` with `skip_refresh=true`, leaving everything else
    /// unchanged. Used when the oracle is unreachable: the session keeps its
    /// remaining lifetime but stops auto-extending.
    pub fn mark_no_refresh(&self, claims: &SessionClaims) -> Result<String, AuthError> {
        let mut next = claims.clone();
        next.skip_refresh = true;
        self.sign(&next)
    }

    /// Implements the refresh-decision algorithm from this crate's session
    /// design: refresh only inside the window, never past the horizon, never
    /// for an already-expired or skip-refresh-flagged session.
    pub fn should_refresh(&self, claims: &SessionClaims) -> bool {
        if !self.refresh_enable {
            return false;
        }
        if claims.skip_refresh {
            return false;
        }
        let now = Utc::now().timestamp();
        let remaining = claims.exp - now;
        if remaining <= 0 {
            return false;
        }
        if remaining > self.refresh_window_secs {
            return false;
        }
        let age = now - claims.iat;
        if age >= self.refresh_horizon_secs {
            return false;
        }
        true
    }
}

/// Converts an untyped extra-claims map (`serde_json::Value`) into the
/// ordered-string-sequence shape `SessionClaims.extra` uses.
pub fn value_map_to_extra(map: &serde_json::Map<String, Value>) -> HashMap<String, Vec<String>> {
    map.iter()
        .filter_map(|(k, v)| match v {
            Value::Array(items) => {
                let strings: Vec<String> = items
                    .iter()
                    .filter_map(|item| item.as_str().map(|s| s.to_string()))
                    .collect();
                Some((k.clone(), strings))
            }
            Value::String(s) => Some((k.clone(), vec![s.clone()])),
            _ => None,
        })
        .collect()
}
