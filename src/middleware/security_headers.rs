//! Security headers middleware.
//!
//! Adds standard security headers to every response to protect against
//! clickjacking, MIME-sniffing, and protocol downgrade attacks. This edge
//! service has no per-deployment header configuration surface — it applies a
//! fixed, secure-by-default header set to all three auth endpoints and the
//! health check alike.

use axum::{
    body::Body,
    http::{Request, header::HeaderValue},
    middleware::Next,
    response::Response,
};

const HSTS_MAX_AGE_SECS: u64 = 31_536_000; // 1 year

/// Middleware that adds security headers to all responses.
pub async fn security_headers_middleware(request: Request<Body>, next: Next) -> Response {
    let is_secure = is_secure_connection(&request);

    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("geolocation=(), camera=(), microphone=()"),
    );

    if is_secure {
        let value = build_hsts_header(HSTS_MAX_AGE_SECS);
        if let Ok(header_value) = HeaderValue::try_from(value) {
            headers.insert("strict-transport-security", header_value);
        }
    }

    response
}

fn build_hsts_header(max_age_secs: u64) -> String {
    format!("max-age={max_age_secs}; includeSubDomains")
}

/// Check if the request came over a secure connection: either the upstream
/// proxy marked it as such (`X-Forwarded-Proto: https`) or the request URI
/// itself carries an `https` scheme.
fn is_secure_connection<B>(request: &Request<B>) -> bool {
    let forwarded_https = request
        .headers()
        .get("x-forwarded-proto")
        .is_some_and(|proto| proto.as_bytes().eq_ignore_ascii_case(b"https"));

    let scheme_https = request
        .uri()
        .scheme_str()
        .is_some_and(|s| s.eq_ignore_ascii_case("https"));

    forwarded_https || scheme_https
}
