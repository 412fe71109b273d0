//! C2 — OIDC Verifier.
//!
//! Lazily discovers an OIDC issuer's metadata, then validates bearer ID
//! tokens against its published key set. Construction is cheap and makes no
//! network call; `start()` performs the one-time discovery fetch (and an
//! initial key-set fetch) and is idempotent.
//!
//! The key set is cached with a TTL and re-fetched either when the cache
//! goes stale or when a token's `kid` isn't found among the cached keys —
//! the latter covers key rotation without waiting out the TTL.
//!
//! `aud` is deliberately *not* enforced: tokens are issued to a sibling
//! OIDC-client-proxy component and forwarded here, so this service is not
//! necessarily in the audience list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use super::AuthError;
use super::session::Principal;
use crate::config::OidcConfig;

/// Claims read out of a verified OIDC ID token. Used only for the lifetime
/// of a single request; never persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct OIDCClaims {
    #[serde(rename = "sub")]
    pub subject: String,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    issuer: String,
    jwks_uri: String,
}

/// Only RS/ES-family algorithms are accepted for OIDC provider signatures;
/// the provider's published signing algorithms and keys are used as-is,
/// never hardcoded to a single one.
fn is_algorithm_allowed(alg: Algorithm) -> bool {
    matches!(
        alg,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::ES256
            | Algorithm::ES384
    )
}

/// The discovery document's fields this verifier needs. Fetched once at
/// `start()` and never refreshed — unlike the key set, the issuer and
/// `jwks_uri` are not expected to change for the lifetime of a deployment.
struct Discovery {
    issuer: String,
    jwks_uri: String,
}

/// The provider's signing keys, indexed by `kid`, with the instant they were
/// fetched. Refreshed on a TTL (`jwks_refresh_secs`) or immediately on a
/// `kid` cache miss, so a key rotation at the provider is picked up without
/// restarting the process.
struct CachedJwks {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

/// Provider discovery, JWKS cache, and bearer-ID-token verification. The
/// real implementation talks to a network issuer; tests substitute a
/// deterministic double rather than standing up a `MockServer` for every
/// dispatcher scenario.
#[async_trait::async_trait]
pub trait OidcVerifier: Send + Sync {
    async fn is_ready(&self) -> bool;
    async fn start(&self) -> Result<(), AuthError>;
    async fn verify(&self, token: &str) -> Result<OIDCClaims, AuthError>;
}

/// Process-wide OIDC verifier. `start()` is invoked once by the server
/// bootstrap, off the request path; every request thereafter reads the
/// cached discovery document and refreshes the key set as needed.
pub struct HttpOidcVerifier {
    http_client: reqwest::Client,
    config: OidcConfig,
    discovery: RwLock<Option<Arc<Discovery>>>,
    jwks_cache: RwLock<Option<CachedJwks>>,
}

impl HttpOidcVerifier {
    pub fn new(http_client: reqwest::Client, config: OidcConfig) -> Self {
        Self {
            http_client,
            config,
            discovery: RwLock::new(None),
            jwks_cache: RwLock::new(None),
        }
    }

    async fn start_inner(&self) -> Result<(), AuthError> {
        if self.discovery.read().await.is_some() {
            return Ok(());
        }

        let mut guard = self.discovery.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let timeout = Duration::from_secs(self.config.init_timeout_secs);
        let discovery = self.fetch_discovery(timeout).await?;
        *guard = Some(Arc::new(discovery));
        drop(guard);

        // Warm the key cache so the first `/auth`/`/verify` call doesn't pay
        // the fetch cost; a failure here still leaves discovery populated,
        // and the next `verify()` will retry the fetch on its first kid miss.
        self.refresh_jwks(timeout).await
    }

    async fn fetch_discovery(&self, timeout: Duration) -> Result<Discovery, AuthError> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            self.config.issuer_url.trim_end_matches('/')
        );
        let response = self
            .http_client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| AuthError::OidcProviderUnreachable(format!("discovery fetch: {e}")))?;

        if !response.status().is_success() {
            return Err(AuthError::OidcProviderUnreachable(format!(
                "discovery endpoint returned {}",
                response.status()
            )));
        }

        let document = response
            .json::<OidcDiscovery>()
            .await
            .map_err(|e| AuthError::OidcProviderUnreachable(format!("discovery parse: {e}")))?;

        Ok(Discovery {
            issuer: document.issuer,
            jwks_uri: document.jwks_uri,
        })
    }

    async fn fetch_jwks(&self, jwks_uri: &str, timeout: Duration) -> Result<JwkSet, AuthError> {
        let response = self
            .http_client
            .get(jwks_uri)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| AuthError::OidcProviderUnreachable(format!("jwks fetch: {e}")))?;

        if !response.status().is_success() {
            return Err(AuthError::OidcProviderUnreachable(format!(
                "jwks endpoint returned {}",
                response.status()
            )));
        }

        response
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::OidcProviderUnreachable(format!("jwks parse: {e}")))
    }

    /// Fetches the provider's current key set and replaces the cache.
    /// Transport failures and deadline overruns surface as
    /// `OidcProviderUnreachable`, a server fault.
    async fn refresh_jwks(&self, timeout: Duration) -> Result<(), AuthError> {
        let jwks_uri = {
            let guard = self.discovery.read().await;
            guard
                .as_ref()
                .ok_or_else(|| AuthError::OidcProviderUnreachable("verifier not started".into()))?
                .jwks_uri
                .clone()
        };

        let jwk_set = self.fetch_jwks(&jwks_uri, timeout).await?;

        let mut keys = HashMap::new();
        for jwk in &jwk_set.keys {
            let Some(kid) = &jwk.common.key_id else {
                continue;
            };
            if let Ok(key) = jwk_to_decoding_key(jwk) {
                keys.insert(kid.clone(), key);
            }
        }

        let mut cache = self.jwks_cache.write().await;
        *cache = Some(CachedJwks {
            keys,
            fetched_at: Instant::now(),
        });
        Ok(())
    }

    /// Returns the decoding key for `kid`, refreshing the cache first when
    /// it's past `jwks_refresh_secs` old or doesn't contain `kid` yet. A
    /// `kid` still missing after a fresh fetch is a client fault (unknown
    /// key); a failed fetch is a server fault.
    async fn get_decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        let refresh_duration = Duration::from_secs(self.config.jwks_refresh_secs);
        {
            let cache = self.jwks_cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < refresh_duration
                && let Some(key) = cached.keys.get(kid)
            {
                return Ok(key.clone());
            }
        }

        let timeout = Duration::from_secs(self.config.init_timeout_secs);
        self.refresh_jwks(timeout).await?;

        let cache = self.jwks_cache.read().await;
        cache
            .as_ref()
            .and_then(|c| c.keys.get(kid).cloned())
            .ok_or_else(|| AuthError::OidcInvalid(format!("no matching key for kid '{kid}'")))
    }
}

#[async_trait::async_trait]
impl OidcVerifier for HttpOidcVerifier {
    /// Whether `start()` has completed successfully at least once. Read by
    /// `/health` without touching the network.
    async fn is_ready(&self) -> bool {
        self.discovery.read().await.is_some()
    }

    /// Performs provider discovery and an initial key-set fetch. Idempotent:
    /// a second call after success is a no-op.
    async fn start(&self) -> Result<(), AuthError> {
        self.start_inner().await
    }

    /// Verifies a bearer ID token string.
    async fn verify(&self, token: &str) -> Result<OIDCClaims, AuthError> {
        let discovery = {
            let guard = self.discovery.read().await;
            guard
                .as_ref()
                .cloned()
                .ok_or_else(|| AuthError::OidcProviderUnreachable("verifier not started".into()))?
        };

        let header = decode_header(token)
            .map_err(|e| AuthError::OidcInvalid(format!("malformed header: {e}")))?;

        if !is_algorithm_allowed(header.alg) {
            return Err(AuthError::OidcInvalid(format!(
                "algorithm {:?} not allowed",
                header.alg
            )));
        }

        let kid = header
            .kid
            .ok_or_else(|| AuthError::OidcInvalid("token header missing kid".into()))?;

        let decoding_key = self.get_decoding_key(&kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&discovery.issuer]);
        validation.validate_aud = false;
        validation.validate_nbf = true;

        let data = decode::<OIDCClaims>(token, &decoding_key, &validation)
            .map_err(|e| AuthError::OidcInvalid(e.to_string()))?;

        Ok(data.claims)
    }
}

fn jwk_to_decoding_key(
    jwk: &jsonwebtoken::jwk::Jwk,
) -> Result<DecodingKey, Box<dyn std::error::Error>> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => {
            Ok(DecodingKey::from_rsa_components(&rsa.n, &rsa.e)?)
        }
        AlgorithmParameters::EllipticCurve(ec) => {
            Ok(DecodingKey::from_ec_components(&ec.x, &ec.y)?)
        }
        other => Err(format!("unsupported jwk algorithm family: {other:?}").into()),
    }
}

/// Maps verified OIDC claims onto a `Principal`. `username`/`groups` carry
/// the configured prefix applied exactly once; the sentinel group
/// `"system:authenticated"` is preserved verbatim.
pub fn derive_principal(claims: &OIDCClaims, username_prefix: &str, groups_prefix: &str) -> Principal {
    let username = format!(
        "{username_prefix}{}",
        claims.preferred_username.as_deref().unwrap_or(&claims.subject)
    );
    let groups = claims
        .groups
        .iter()
        .map(|g| {
            if g == "system:authenticated" {
                g.clone()
            } else {
                format!("{groups_prefix}{g}")
            }
        })
        .collect();

    Principal {
        uid: claims.subject.clone(),
        username,
        groups,
        extra: super::session::value_map_to_extra(&claims.extra),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OidcConfig {
        OidcConfig {
            issuer_url: "https://issuer.example.com".to_string(),
            client_id: "workspace-proxy".to_string(),
            init_timeout_secs: 5,
            jwks_refresh_secs: 3600,
            username_prefix: "github:".to_string(),
            groups_prefix: "github:".to_string(),
        }
    }

    #[test]
    fn derive_principal_prefixes_username_and_groups() {
        let claims = OIDCClaims {
            subject: "u-1".to_string(),
            preferred_username: Some("alice".to_string()),
            email: None,
            groups: vec!["org1:t1".to_string(), "system:authenticated".to_string()],
            extra: serde_json::Map::new(),
        };
        let principal = derive_principal(&claims, "github:", "github:");
        assert_eq!(principal.username, "github:alice");
        assert_eq!(principal.uid, "u-1");
        assert_eq!(
            principal.groups,
            vec!["github:org1:t1".to_string(), "system:authenticated".to_string()]
        );
    }

    #[tokio::test]
    async fn not_ready_before_start() {
        let verifier = HttpOidcVerifier::new(reqwest::Client::new(), config());
        assert!(!verifier.is_ready().await);
    }

    #[tokio::test]
    async fn verify_before_start_is_oidc_provider_unreachable() {
        let verifier = HttpOidcVerifier::new(reqwest::Client::new(), config());
        let err = verifier.verify("not-a-real-token").await.unwrap_err();
        assert!(err.is_server_fault());
    }

    #[tokio::test]
    async fn get_decoding_key_before_start_is_server_fault() {
        let verifier = HttpOidcVerifier::new(reqwest::Client::new(), config());
        let err = verifier.get_decoding_key("some-kid").await.unwrap_err();
        assert!(err.is_server_fault());
    }
}

/// Deterministic `OidcVerifier` double for dispatcher tests: no network, no
/// discovery, a fixed verdict per call.
#[cfg(test)]
pub mod test_support {
    use super::{AuthError, OIDCClaims, OidcVerifier};

    pub struct StaticOidcVerifier {
        pub ready: bool,
        pub result: Result<OIDCClaims, AuthError>,
    }

    impl Clone for StaticOidcVerifier {
        fn clone(&self) -> Self {
            Self {
                ready: self.ready,
                result: match &self.result {
                    Ok(claims) => Ok(claims.clone()),
                    Err(e) => Err(e.clone()),
                },
            }
        }
    }

    #[async_trait::async_trait]
    impl OidcVerifier for StaticOidcVerifier {
        async fn is_ready(&self) -> bool {
            self.ready
        }

        async fn start(&self) -> Result<(), AuthError> {
            Ok(())
        }

        async fn verify(&self, _token: &str) -> Result<OIDCClaims, AuthError> {
            match &self.result {
                Ok(claims) => Ok(claims.clone()),
                Err(e) => Err(e.clone()),
            }
        }
    }
}
