use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Error kinds produced by the path extractor, OIDC verifier, session engine,
/// cookie layer, oracle client, and request dispatcher.
///
/// Each variant carries exactly the status code the dispatcher returns to the
/// proxy for that failure; see the `IntoResponse` impl below.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// A header the dispatcher requires (e.g. `X-Forwarded-Uri`) was absent.
    MissingHeader(&'static str),

    /// The forwarded URL could not be decomposed into namespace/name.
    BadUrl(String),

    /// No session cookie present where one was required.
    MissingCookie,

    /// Session token signature did not verify.
    SignatureInvalid,

    /// Session token is structurally malformed or its claims fail schema checks.
    ClaimsInvalid(String),

    /// Session token has expired and is past its refresh window.
    TokenExpired,

    /// Session token's `typ` claim doesn't match what the endpoint expects
    /// (e.g. a bootstrap token presented where a full session was required).
    WrongTokenType,

    /// Bearer token failed OIDC verification (bad signature, issuer, or expiry).
    OidcInvalid(String),

    /// Session identity does not match the identity implied by the OIDC token
    /// presented alongside it.
    IdentityMismatch,

    /// Session's bound AppPath does not match the path of the current request.
    PathDomainMismatch,

    /// The access oracle denied the request (including "not found" denials).
    AccessDenied(String),

    /// No workspace could be resolved for the given namespace/name.
    WorkspaceNotFound,

    /// The OIDC provider (discovery endpoint or JWKS) could not be reached or
    /// returned a malformed response. Treated as a server fault by callers.
    OidcProviderUnreachable(String),

    /// The access oracle could not be reached or returned a malformed response.
    OracleUnreachable(String),

    /// Any other unexpected internal failure.
    Internal(String),
}

impl AuthError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AuthError::MissingHeader(_) => (StatusCode::BAD_REQUEST, "missing_header"),
            AuthError::BadUrl(_) => (StatusCode::BAD_REQUEST, "bad_url"),
            AuthError::MissingCookie => (StatusCode::UNAUTHORIZED, "missing_cookie"),
            AuthError::SignatureInvalid => (StatusCode::UNAUTHORIZED, "signature_invalid"),
            AuthError::ClaimsInvalid(_) => (StatusCode::UNAUTHORIZED, "claims_invalid"),
            AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "token_expired"),
            AuthError::WrongTokenType => (StatusCode::UNAUTHORIZED, "wrong_token_type"),
            AuthError::OidcInvalid(_) => (StatusCode::FORBIDDEN, "oidc_invalid"),
            AuthError::IdentityMismatch => (StatusCode::UNAUTHORIZED, "identity_mismatch"),
            AuthError::PathDomainMismatch => (StatusCode::FORBIDDEN, "path_domain_mismatch"),
            AuthError::AccessDenied(_) => (StatusCode::FORBIDDEN, "access_denied"),
            AuthError::WorkspaceNotFound => (StatusCode::FORBIDDEN, "workspace_not_found"),
            AuthError::OidcProviderUnreachable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "oidc_provider_unreachable")
            }
            AuthError::OracleUnreachable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "oracle_unreachable")
            }
            AuthError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }

    /// True for faults caused by an unreachable/misbehaving upstream (OIDC
    /// provider or access oracle) rather than a bad or malicious request.
    /// The dispatcher uses this to decide whether a failure is retriable.
    pub fn is_server_fault(&self) -> bool {
        matches!(
            self,
            AuthError::OidcProviderUnreachable(_)
                | AuthError::OracleUnreachable(_)
                | AuthError::Internal(_)
        )
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = self.to_string();
        let body = ErrorBody {
            error: ErrorDetail { code, message },
        };
        (status, Json(body)).into_response()
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingHeader(name) => write!(f, "missing required header '{name}'"),
            AuthError::BadUrl(detail) => write!(f, "could not parse forwarded URL: {detail}"),
            AuthError::MissingCookie => write!(f, "no session cookie present"),
            AuthError::SignatureInvalid => write!(f, "session token signature invalid"),
            AuthError::ClaimsInvalid(detail) => write!(f, "session token claims invalid: {detail}"),
            AuthError::TokenExpired => write!(f, "session token has expired"),
            AuthError::WrongTokenType => write!(f, "session token type not valid for this endpoint"),
            AuthError::OidcInvalid(detail) => write!(f, "bearer token failed verification: {detail}"),
            AuthError::IdentityMismatch => {
                write!(f, "session identity does not match presented credentials")
            }
            AuthError::PathDomainMismatch => {
                write!(f, "session is not valid for the requested path")
            }
            AuthError::AccessDenied(reason) => write!(f, "access denied: {reason}"),
            AuthError::WorkspaceNotFound => write!(f, "workspace not found"),
            AuthError::OidcProviderUnreachable(detail) => {
                write!(f, "OIDC provider unreachable: {detail}")
            }
            AuthError::OracleUnreachable(detail) => write!(f, "access oracle unreachable: {detail}"),
            AuthError::Internal(detail) => write!(f, "internal error: {detail}"),
        }
    }
}

impl std::error::Error for AuthError {}
