//! C6 — Request Dispatcher.
//!
//! Implements the `/auth`, `/bearer-auth`, and `/verify` state machines by
//! orchestrating C1 (path extraction), C2 (OIDC verification), C3 (session
//! tokens), C4 (cookies), and C5 (the access oracle).

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde_json::Value;
use tower_cookies::Cookies;
use tracing::{info, warn};

use crate::auth::AuthError;
use crate::auth::cookie;
use crate::auth::oidc::derive_principal;
use crate::auth::path::{extract_app_path, extract_workspace};
use crate::auth::session::TokenType;
use crate::state::AppState;

fn required_header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, AuthError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or(AuthError::MissingHeader(name))
}

fn optional_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = required_header(headers, "authorization")?;
    value
        .strip_prefix("Bearer ")
        .filter(|s| !s.is_empty())
        .ok_or(AuthError::MissingHeader("authorization"))
}

/// Extracts the `?token=` query parameter from a raw forwarded URI.
fn extract_bootstrap_token(forwarded_uri: &str) -> Result<String, AuthError> {
    let query = forwarded_uri
        .split_once('?')
        .map(|(_, q)| q)
        .ok_or_else(|| AuthError::BadUrl("forwarded URI has no query string".into()))?;

    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("token=") {
            if value.is_empty() {
                break;
            }
            return Ok(value.to_string());
        }
    }
    Err(AuthError::BadUrl(
        "forwarded URI missing 'token' query parameter".into(),
    ))
}

fn forwarded_path_only(forwarded_uri: &str) -> &str {
    forwarded_uri.split('?').next().unwrap_or(forwarded_uri)
}

/// `GET /auth` — first contact. Verifies an OIDC bearer token, consults the
/// access oracle, and mints a session cookie.
pub async fn auth(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    cookies: Cookies,
) -> Result<Json<Value>, AuthError> {
    let forwarded_uri = required_header(&headers, "x-forwarded-uri")?;
    let forwarded_host = required_header(&headers, "x-forwarded-host")?.to_string();
    let token = bearer_token(&headers)?;

    let request_path = forwarded_path_only(forwarded_uri);
    let app_path = extract_app_path(request_path, &state.app_path_regex);

    let claims = match state.oidc.verify(token).await {
        Ok(claims) => claims,
        Err(e) if e.is_server_fault() => {
            warn!(reason = %e, "oidc verification server fault");
            return Err(e);
        }
        Err(e) => {
            warn!(reason = %e, "oidc verification rejected bearer token");
            return Err(AuthError::OidcInvalid(e.to_string()));
        }
    };

    let principal = derive_principal(
        &claims,
        &state.config.oidc.username_prefix,
        &state.config.oidc.groups_prefix,
    );

    if let Some(expected_uid) = optional_header(&headers, "x-auth-request-user")
        && expected_uid != principal.uid
    {
        warn!(uid = %principal.uid, expected = %expected_uid, "uid mismatch on cross-check");
        return Err(AuthError::IdentityMismatch);
    }

    if let Some(expected_username) = optional_header(&headers, "x-auth-request-preferred-username")
    {
        let prefixed = format!("{}{}", state.config.oidc.username_prefix, expected_username);
        if prefixed != principal.username {
            warn!(username = %principal.username, "username mismatch on cross-check");
            return Err(AuthError::IdentityMismatch);
        }
    }

    if let Some(header_groups) = optional_header(&headers, "x-auth-request-groups") {
        for group in header_groups.split(',').map(str::trim).filter(|g| !g.is_empty()) {
            if !principal.groups.iter().any(|g| g == group) {
                warn!(group = %group, "header group not present in token groups");
                return Err(AuthError::IdentityMismatch);
            }
        }
    }

    let workspace = extract_workspace(
        request_path,
        &state.namespace_regex,
        &state.name_regex,
    )?;

    let decision = state
        .oracle
        .review(
            &workspace.namespace,
            &workspace.name,
            &principal.username,
            &principal.groups,
            &principal.uid,
            &principal.extra,
        )
        .await?;

    if !decision.allowed {
        warn!(reason = %decision.reason, workspace = %workspace.name, "oracle denied access");
        return Err(AuthError::AccessDenied(decision.reason));
    }

    let token = state
        .session_engine
        .generate(&principal, &app_path, &forwarded_host, TokenType::Session)?;

    cookie::set_cookie(&cookies, &state.config.cookie, token, &app_path);

    info!(user = %principal.username, workspace = %workspace.name, "auth granted");
    Ok(Json(serde_json::json!({})))
}

/// `GET /bearer-auth` — exchanges a URL-embedded bootstrap token for a
/// durable session cookie.
pub async fn bearer_auth(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    cookies: Cookies,
) -> Result<Json<Value>, AuthError> {
    let forwarded_uri = required_header(&headers, "x-forwarded-uri")?;
    let token = extract_bootstrap_token(forwarded_uri)?;

    let claims = state.session_engine.validate(&token).map_err(|e| {
        warn!(reason = %e, "bootstrap token failed validation");
        e
    })?;

    if claims.token_type != TokenType::Bootstrap {
        warn!("bootstrap exchange presented a non-bootstrap token");
        return Err(AuthError::WrongTokenType);
    }

    let forwarded_host = required_header(&headers, "x-forwarded-host")?.to_string();
    let request_path = forwarded_path_only(forwarded_uri);
    let app_path = extract_app_path(request_path, &state.app_path_regex);

    if claims.path != app_path {
        warn!(expected = %claims.path, actual = %app_path, "bootstrap token path mismatch");
        return Err(AuthError::PathDomainMismatch);
    }

    let principal = crate::auth::session::Principal {
        uid: claims.uid,
        username: claims.user,
        groups: claims.groups,
        extra: claims.extra,
    };

    let session_token = state.session_engine.generate(
        &principal,
        &app_path,
        &forwarded_host,
        TokenType::Session,
    )?;

    cookie::set_cookie(&cookies, &state.config.cookie, session_token, &app_path);

    info!(user = %principal.username, "bootstrap exchange succeeded");
    Ok(Json(serde_json::json!({})))
}

/// `GET /verify` — hot path, runs on every protected request.
pub async fn verify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    cookies: Cookies,
) -> Result<Json<Value>, AuthError> {
    let forwarded_uri = required_header(&headers, "x-forwarded-uri")?;
    let forwarded_host = required_header(&headers, "x-forwarded-host")?;
    let request_path = forwarded_path_only(forwarded_uri);

    let token = cookie::get_cookie(&cookies, &state.config.cookie)?;
    let claims = state.session_engine.validate(&token)?;

    if claims.token_type != TokenType::Session {
        warn!("verify presented a non-session token");
        return Err(AuthError::WrongTokenType);
    }

    if !request_path.starts_with(&claims.path) {
        warn!(path = %claims.path, request_path = %request_path, "path not authorized");
        return Err(AuthError::PathDomainMismatch);
    }

    if claims.domain != forwarded_host {
        warn!(domain = %claims.domain, request_host = %forwarded_host, "domain not authorized");
        return Err(AuthError::PathDomainMismatch);
    }

    if !state.session_engine.should_refresh(&claims) {
        return Ok(Json(serde_json::json!({})));
    }

    let workspace = extract_workspace(
        request_path,
        &state.namespace_regex,
        &state.name_regex,
    )?;

    match state
        .oracle
        .review(
            &workspace.namespace,
            &workspace.name,
            &claims.user,
            &claims.groups,
            &claims.uid,
            &claims.extra,
        )
        .await
    {
        Err(e) if e.is_server_fault() => {
            warn!(reason = %e, "oracle unreachable during verify, degrading to no-refresh");
            let token = state.session_engine.mark_no_refresh(&claims)?;
            cookie::set_cookie(&cookies, &state.config.cookie, token, &claims.path);
            Ok(Json(serde_json::json!({})))
        }
        Err(e) => Err(e),
        Ok(decision) if !decision.allowed => {
            warn!(reason = %decision.reason, "oracle denied access on refresh check");
            cookie::clear_cookie(&cookies, &state.config.cookie, &claims.path);
            Err(AuthError::AccessDenied(decision.reason))
        }
        Ok(_) => {
            let token = state.session_engine.refresh(&claims)?;
            cookie::set_cookie(&cookies, &state.config.cookie, token, &claims.path);
            Ok(Json(serde_json::json!({})))
        }
    }
}


/// Full state-machine scenarios from this crate's test-design notes, driving
/// the three handlers directly against deterministic OIDC/oracle doubles
/// rather than standing up a real issuer and orchestrator per test.
#[cfg(test)]
mod state_machine_tests {
    use std::collections::HashMap;

    use axum::http::HeaderValue;
    use regex::Regex;
    use tower_cookies::{Cookie, Cookies};

    use super::*;
    use crate::auth::oidc::OIDCClaims;
    use crate::auth::oidc::test_support::StaticOidcVerifier;
    use crate::auth::session::SessionEngine;
    use crate::authz::oracle::AccessDecision;
    use crate::authz::oracle::test_support::StaticOracleClient;
    use crate::config::{Config, JwtConfig};
    use crate::state::AppState;

    fn jwt_config() -> JwtConfig {
        JwtConfig {
            signing_key: "dispatcher-test-signing-key-32-bytes-min".to_string(),
            issuer: "workspace-auth-gateway".to_string(),
            audience: "workspaces".to_string(),
            expiration_secs: 3600,
            refresh_enable: true,
            refresh_window_secs: 900,
            refresh_horizon_secs: 12 * 3600,
        }
    }

    fn base_config() -> Config {
        Config::from_str(
            r#"
[jwt]
signing_key = "dispatcher-test-signing-key-32-bytes-min"

[oidc]
issuer_url = "https://issuer.example.com"
client_id = "workspace-proxy"
username_prefix = "github:"
groups_prefix = "github:"
"#,
        )
        .unwrap()
    }

    fn state_with(
        oidc_result: Result<OIDCClaims, AuthError>,
        oracle_result: Result<AccessDecision, AuthError>,
    ) -> Arc<AppState> {
        Arc::new(AppState {
            config: Arc::new(base_config()),
            oidc: Arc::new(StaticOidcVerifier {
                ready: true,
                result: oidc_result,
            }),
            session_engine: Arc::new(SessionEngine::new(&jwt_config())),
            oracle: Arc::new(StaticOracleClient {
                result: oracle_result,
            }),
            app_path_regex: Regex::new(r"^(/workspaces/[^/]+/[^/]+)").unwrap(),
            namespace_regex: Regex::new(r"^/workspaces/([^/]+)/[^/]+").unwrap(),
            name_regex: Regex::new(r"^/workspaces/[^/]+/([^/]+)").unwrap(),
        })
    }

    fn headers_for(uri: &str, host: &str, bearer: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-uri", HeaderValue::from_str(uri).unwrap());
        headers.insert("x-forwarded-host", HeaderValue::from_str(host).unwrap());
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {bearer}")).unwrap(),
        );
        headers
    }

    fn good_claims() -> OIDCClaims {
        OIDCClaims {
            subject: "u-1".to_string(),
            preferred_username: Some("alice".to_string()),
            email: None,
            groups: vec!["org1:t1".to_string(), "org1:t2".to_string()],
            extra: serde_json::Map::new(),
        }
    }

    fn allow() -> AccessDecision {
        AccessDecision {
            allowed: true,
            reason: String::new(),
        }
    }

    fn deny(reason: &str) -> AccessDecision {
        AccessDecision {
            allowed: false,
            reason: reason.to_string(),
        }
    }

    fn set_cookie_in_jar(cookies: &Cookies, name: &str, token: String) {
        cookies.add(Cookie::build((name.to_string(), token)).build());
    }

    // Scenario 1: `/auth` happy path.
    #[tokio::test]
    async fn auth_happy_path_mints_scoped_session_cookie() {
        let state = state_with(Ok(good_claims()), Ok(allow()));
        let cookies = Cookies::default();
        let headers = headers_for(
            "/workspaces/ns1/app1/notebooks/nb1.ipynb",
            "example.com",
            "good-token",
        );

        let result = auth(State(state.clone()), headers, cookies.clone()).await;
        assert!(result.is_ok());

        let cookie = cookies.get(&state.config.cookie.name).unwrap();
        assert_eq!(cookie.path(), Some("/workspaces/ns1/app1"));

        let claims = state.session_engine.validate(cookie.value()).unwrap();
        assert_eq!(claims.user, "github:alice");
        assert_eq!(
            claims.groups,
            vec!["github:org1:t1".to_string(), "github:org1:t2".to_string()]
        );
        assert_eq!(claims.uid, "u-1");
        assert_eq!(claims.path, "/workspaces/ns1/app1");
        assert_eq!(claims.domain, "example.com");
        assert_eq!(claims.token_type, TokenType::Session);
    }

    // Scenario 2: `/auth` identity mismatch via cross-check header.
    #[tokio::test]
    async fn auth_rejects_uid_cross_check_mismatch() {
        let state = state_with(Ok(good_claims()), Ok(allow()));
        let cookies = Cookies::default();
        let mut headers = headers_for(
            "/workspaces/ns1/app1/notebooks/nb1.ipynb",
            "example.com",
            "good-token",
        );
        headers.insert("x-auth-request-user", HeaderValue::from_static("u-2"));

        let err = auth(State(state), headers, cookies.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::IdentityMismatch));
        assert!(cookies.get("workspace_session").is_none());
    }

    // Scenario 3: `/auth` oracle denies.
    #[tokio::test]
    async fn auth_rejects_when_oracle_denies() {
        let state = state_with(Ok(good_claims()), Ok(deny("no RBAC")));
        let cookies = Cookies::default();
        let headers = headers_for(
            "/workspaces/ns1/app1/notebooks/nb1.ipynb",
            "example.com",
            "good-token",
        );

        let err = auth(State(state), headers, cookies.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccessDenied(_)));
        assert!(cookies.get("workspace_session").is_none());
    }

    // Scenario 4: `/verify` in refresh window, oracle allows.
    #[tokio::test]
    async fn verify_refreshes_when_in_window_and_oracle_allows() {
        let state = state_with(Ok(good_claims()), Ok(allow()));
        let principal = crate::auth::session::Principal {
            uid: "u-1".to_string(),
            username: "github:alice".to_string(),
            groups: vec!["github:org1:t1".to_string()],
            extra: HashMap::new(),
        };
        let mut claims = state
            .session_engine
            .validate(
                &state
                    .session_engine
                    .generate(
                        &principal,
                        "/workspaces/ns1/app1",
                        "example.com",
                        TokenType::Session,
                    )
                    .unwrap(),
            )
            .unwrap();
        // 6h old, 10m to expiry: inside the 15m window, inside the 12h horizon.
        let now = chrono::Utc::now().timestamp();
        claims.iat = now - 6 * 3600;
        claims.exp = now + 10 * 60;
        let old_exp = claims.exp;
        let old_iat = claims.iat;

        let cookies = Cookies::default();
        set_cookie_in_jar(
            &cookies,
            &state.config.cookie.name,
            state_sign_for_test(&state, &claims),
        );

        let headers = headers_for("/workspaces/ns1/app1/notebooks/nb1.ipynb", "example.com", "x");
        let result = verify(State(state.clone()), headers, cookies.clone()).await;
        assert!(result.is_ok());

        let new_cookie = cookies.get(&state.config.cookie.name).unwrap();
        let new_claims = state.session_engine.validate(new_cookie.value()).unwrap();
        assert!(new_claims.exp > old_exp);
        assert_eq!(new_claims.iat, old_iat);
    }

    // Scenario 5: `/verify` in refresh window, oracle unreachable.
    #[tokio::test]
    async fn verify_degrades_to_no_refresh_when_oracle_unreachable() {
        let state = state_with(
            Ok(good_claims()),
            Err(AuthError::OracleUnreachable("connection refused".into())),
        );
        let principal = crate::auth::session::Principal {
            uid: "u-1".to_string(),
            username: "github:alice".to_string(),
            groups: vec![],
            extra: HashMap::new(),
        };
        let mut claims = state
            .session_engine
            .validate(
                &state
                    .session_engine
                    .generate(
                        &principal,
                        "/workspaces/ns1/app1",
                        "example.com",
                        TokenType::Session,
                    )
                    .unwrap(),
            )
            .unwrap();
        claims.exp = chrono::Utc::now().timestamp() + 100; // inside refresh window

        let cookies = Cookies::default();
        set_cookie_in_jar(
            &cookies,
            &state.config.cookie.name,
            state_sign_for_test(&state, &claims),
        );

        let headers = headers_for("/workspaces/ns1/app1/notebooks/nb1.ipynb", "example.com", "x");
        let result = verify(State(state.clone()), headers, cookies.clone()).await;
        assert!(result.is_ok());

        let new_cookie = cookies.get(&state.config.cookie.name).unwrap();
        let new_claims = state.session_engine.validate(new_cookie.value()).unwrap();
        assert!(new_claims.skip_refresh);
        assert_eq!(new_claims.uid, claims.uid);
        assert_eq!(new_claims.path, claims.path);
    }

    // Scenario 6: `/verify` past refresh horizon does not refresh or mutate.
    #[tokio::test]
    async fn verify_does_not_refresh_past_horizon() {
        let state = state_with(Ok(good_claims()), Ok(allow()));
        let principal = crate::auth::session::Principal {
            uid: "u-1".to_string(),
            username: "github:alice".to_string(),
            groups: vec![],
            extra: HashMap::new(),
        };
        let mut claims = state
            .session_engine
            .validate(
                &state
                    .session_engine
                    .generate(
                        &principal,
                        "/workspaces/ns1/app1",
                        "example.com",
                        TokenType::Session,
                    )
                    .unwrap(),
            )
            .unwrap();
        let now = chrono::Utc::now().timestamp();
        claims.iat = now - 24 * 3600; // past the 12h horizon
        claims.exp = now + 5 * 60; // inside the 15m window

        let original_token = state_sign_for_test(&state, &claims);
        let cookies = Cookies::default();
        set_cookie_in_jar(&cookies, &state.config.cookie.name, original_token.clone());

        let headers = headers_for("/workspaces/ns1/app1/notebooks/nb1.ipynb", "example.com", "x");
        let result = verify(State(state.clone()), headers, cookies.clone()).await;
        assert!(result.is_ok());

        let unchanged_cookie = cookies.get(&state.config.cookie.name).unwrap();
        assert_eq!(unchanged_cookie.value(), original_token);
    }

    // Scenario 7: `/bearer-auth` path mismatch.
    #[tokio::test]
    async fn bearer_auth_rejects_path_mismatch() {
        let state = state_with(Ok(good_claims()), Ok(allow()));
        let principal = crate::auth::session::Principal {
            uid: "u-1".to_string(),
            username: "github:alice".to_string(),
            groups: vec![],
            extra: HashMap::new(),
        };
        let bootstrap_token = state
            .session_engine
            .generate(
                &principal,
                "/workspaces/a/b",
                "example.com",
                TokenType::Bootstrap,
            )
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-uri",
            HeaderValue::from_str(&format!("/workspaces/c/d/?token={bootstrap_token}")).unwrap(),
        );
        headers.insert("x-forwarded-host", HeaderValue::from_static("example.com"));

        let cookies = Cookies::default();
        let err = bearer_auth(State(state), headers, cookies).await.unwrap_err();
        assert!(matches!(err, AuthError::PathDomainMismatch));
    }

    #[tokio::test]
    async fn bearer_auth_exchanges_bootstrap_for_session_cookie() {
        let state = state_with(Ok(good_claims()), Ok(allow()));
        let principal = crate::auth::session::Principal {
            uid: "u-1".to_string(),
            username: "github:alice".to_string(),
            groups: vec!["github:org1:t1".to_string()],
            extra: HashMap::new(),
        };
        let bootstrap_token = state
            .session_engine
            .generate(
                &principal,
                "/workspaces/ns1/app1",
                "example.com",
                TokenType::Bootstrap,
            )
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-uri",
            HeaderValue::from_str(&format!(
                "/workspaces/ns1/app1/notebooks/nb1.ipynb?token={bootstrap_token}"
            ))
            .unwrap(),
        );
        headers.insert("x-forwarded-host", HeaderValue::from_static("example.com"));

        let cookies = Cookies::default();
        let result = bearer_auth(State(state.clone()), headers, cookies.clone()).await;
        assert!(result.is_ok());

        let cookie = cookies.get(&state.config.cookie.name).unwrap();
        let claims = state.session_engine.validate(cookie.value()).unwrap();
        assert_eq!(claims.token_type, TokenType::Session);
        assert_eq!(claims.path, "/workspaces/ns1/app1");
    }

    /// Test-only helper to sign a hand-crafted claims value directly,
    /// bypassing `generate`'s `now`-derived fields so scenarios can pin
    /// exact `iat`/`exp` values.
    fn state_sign_for_test(
        state: &AppState,
        claims: &crate::auth::session::SessionClaims,
    ) -> String {
        use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
        let key = EncodingKey::from_secret(state.config.jwt.signing_key.as_bytes());
        encode(&Header::new(Algorithm::HS256), claims, &key).unwrap()
    }
}
