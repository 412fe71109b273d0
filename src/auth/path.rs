//! C1 — Path Extractor.
//!
//! Derives the canonical AppPath and `(namespace, name)` workspace target
//! from the URL the reverse proxy forwards, via three operator-configured
//! regexes. The regexes themselves are compiled once at config-load time;
//! this module only ever sees already-valid `Regex` values.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::AuthError;

/// A resolved `(namespace, name)` pair identifying a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceTarget {
    pub namespace: String,
    pub name: String,
}

/// Returns the canonical AppPath for `full_path`.
///
/// Fail-open: if `app_regex` does not match, the full path is returned
/// unchanged. Empty input returns empty. `app_regex` is assumed already
/// compiled and valid — an invalid pattern string is a boot-time
/// configuration error, never a per-request concern.
pub fn extract_app_path(full_path: &str, app_regex: &Regex) -> String {
    if full_path.is_empty() {
        return String::new();
    }
    match app_regex.captures(full_path) {
        Some(caps) => caps
            .get(1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| full_path.to_string()),
        None => full_path.to_string(),
    }
}

/// Extracts the `(namespace, name)` workspace target from `full_path`.
///
/// Both regexes must capture exactly one group and match; a missing match
/// on either is a client error (malformed/unrecognized URL).
pub fn extract_workspace(
    full_path: &str,
    namespace_regex: &Regex,
    name_regex: &Regex,
) -> Result<WorkspaceTarget, AuthError> {
    let namespace = namespace_regex
        .captures(full_path)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AuthError::BadUrl(format!("no namespace in path '{full_path}'")))?;

    let name = name_regex
        .captures(full_path)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AuthError::BadUrl(format!("no workspace name in path '{full_path}'")))?;

    Ok(WorkspaceTarget { namespace, name })
}
