//! C4 — Cookie Layer.
//!
//! Maps session artifacts onto HTTP cookies. The cookie's `Path` is derived
//! from the forwarded request URL (via C1), not the static configured path,
//! so a session minted for one workspace never leaks as a cookie readable by
//! another workspace at the same host.

use tower_cookies::{Cookie, Cookies};

use super::AuthError;
use crate::config::CookieConfig;

/// Writes the session cookie, scoped to `app_path` (falling back to the
/// configured static path when `app_path` is empty or `/`).
pub fn set_cookie(cookies: &Cookies, config: &CookieConfig, token: String, app_path: &str) {
    let path = if app_path.is_empty() || app_path == "/" {
        config.path.clone()
    } else {
        app_path.to_string()
    };

    let mut builder = Cookie::build((config.name.clone(), token))
        .path(path)
        .max_age(tower_cookies::cookie::time::Duration::seconds(
            config.max_age_secs,
        ))
        .secure(config.secure)
        .http_only(config.http_only)
        .same_site(config.same_site.to_cookie_same_site());

    if let Some(domain) = &config.domain {
        builder = builder.domain(domain.clone());
    }

    cookies.add(builder.build());
}

/// Reads the named session cookie's value. Returns `MissingCookie` when the
/// cookie isn't present at all, and `ClaimsInvalid` when it is present but
/// structurally empty — distinct from "not present" so the dispatcher can
/// tell a browser that never had a session apart from one sending a cookie a
/// prior response already cleared. Signature/claims validity beyond that is
/// C3's concern, not this layer's.
pub fn get_cookie(cookies: &Cookies, config: &CookieConfig) -> Result<String, AuthError> {
    let Some(cookie) = cookies.get(&config.name) else {
        return Err(AuthError::MissingCookie);
    };

    let value = cookie.value().to_string();
    if value.is_empty() {
        return Err(AuthError::ClaimsInvalid(
            "session cookie present but empty".to_string(),
        ));
    }

    Ok(value)
}

/// Writes a same-attributes cookie with an empty value and `Max-Age=-1`,
/// causing the browser to drop it immediately.
pub fn clear_cookie(cookies: &Cookies, config: &CookieConfig, app_path: &str) {
    let path = if app_path.is_empty() || app_path == "/" {
        config.path.clone()
    } else {
        app_path.to_string()
    };

    let mut builder = Cookie::build((config.name.clone(), ""))
        .path(path)
        .max_age(tower_cookies::cookie::time::Duration::seconds(-1))
        .secure(config.secure)
        .http_only(config.http_only)
        .same_site(config.same_site.to_cookie_same_site());

    if let Some(domain) = &config.domain {
        builder = builder.domain(domain.clone());
    }

    cookies.add(builder.build());
}
