//! Configuration for the auth gateway.
//!
//! The gateway is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:8080"
//!
//! [jwt]
//! signing_key = "${SESSION_SIGNING_KEY}"
//! issuer = "workspace-auth-gateway"
//! audience = "workspaces"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Root configuration for the auth gateway. Immutable after boot.
#[derive(Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub http_client: HttpClientConfig,

    pub jwt: JwtConfig,

    #[serde(default)]
    pub cookie: CookieConfig,

    #[serde(default)]
    pub path: PathConfig,

    pub oidc: OidcConfig,

    #[serde(default)]
    pub oracle: OracleConfig,

    #[serde(default)]
    pub features: FeatureToggles,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// Secrets must never leak into logs; this mirrors the signing-key/client-secret
// redaction convention used elsewhere in this codebase's config types.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .field("http_client", &self.http_client)
            .field("jwt", &self.jwt)
            .field("cookie", &self.cookie)
            .field("path", &self.path)
            .field("oidc", &self.oidc)
            .field("oracle", &self.oracle)
            .field("features", &self.features)
            .field("observability", &self.observability)
            .finish()
    }
}

impl Config {
    /// Load configuration from a TOML file, expanding `${VAR}` references
    /// against the process environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;
        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let mut config: Config = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants that serde's typed deserialization can't
    /// express on its own.
    fn validate(&mut self) -> Result<(), ConfigError> {
        self.jwt.validate()?;
        self.path.validate()?;
        self.oidc.validate()?;
        self.cookie.validate()?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("configuration validation error: {0}")]
    Validation(String),
}

/// Expand `${VAR_NAME}` references against the process environment, skipping
/// anything that appears after a `#` comment on the same line.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let match_start = cap.get(0).unwrap().start();
            if let Some(pos) = comment_pos
                && match_start >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..match_start]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = cap.get(0).unwrap().end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    if !input.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// How long graceful shutdown waits for in-flight requests to finish
    /// before the process exits regardless.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Per-request timeout enforced by the server, independent of any
    /// downstream HTTP client timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_shutdown_timeout_secs() -> u64 {
    30
}
fn default_request_timeout_secs() -> u64 {
    15
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound HTTP client (shared by the OIDC verifier and the oracle client)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct HttpClientConfig {
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_http_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout_secs(),
            connect_timeout_secs: default_http_connect_timeout_secs(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(self.connect_timeout_secs))
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .user_agent(&self.user_agent)
            .build()
    }
}

fn default_http_timeout_secs() -> u64 {
    10
}
fn default_http_connect_timeout_secs() -> u64 {
    5
}
fn default_pool_max_idle_per_host() -> usize {
    32
}
fn default_user_agent() -> String {
    concat!("workspace-auth-gateway/", env!("CARGO_PKG_VERSION")).to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// JWT / session token engine (C3)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct JwtConfig {
    /// HMAC signing key. Never logged: the `Debug` impl redacts this field.
    pub signing_key: String,

    #[serde(default = "default_jwt_issuer")]
    pub issuer: String,

    #[serde(default = "default_jwt_audience")]
    pub audience: String,

    /// Session lifetime at issuance/refresh, in seconds.
    #[serde(default = "default_jwt_expiration_secs")]
    pub expiration_secs: i64,

    /// Whether `/verify` may refresh a session close to expiry.
    #[serde(default = "default_true")]
    pub refresh_enable: bool,

    /// Time before expiry (seconds) during which a session is refresh-eligible.
    #[serde(default = "default_refresh_window_secs")]
    pub refresh_window_secs: i64,

    /// Hard ceiling (seconds) on how long a session may keep refreshing,
    /// measured from its original `iat`.
    #[serde(default = "default_refresh_horizon_secs")]
    pub refresh_horizon_secs: i64,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("signing_key", &"****")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("expiration_secs", &self.expiration_secs)
            .field("refresh_enable", &self.refresh_enable)
            .field("refresh_window_secs", &self.refresh_window_secs)
            .field("refresh_horizon_secs", &self.refresh_horizon_secs)
            .finish()
    }
}

impl JwtConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.signing_key.is_empty() {
            return Err(ConfigError::Validation(
                "jwt.signing_key must not be empty".into(),
            ));
        }
        if self.refresh_window_secs > self.expiration_secs {
            return Err(ConfigError::Validation(
                "jwt.refresh_window_secs must be <= jwt.expiration_secs".into(),
            ));
        }
        if self.expiration_secs > self.refresh_horizon_secs {
            return Err(ConfigError::Validation(
                "jwt.expiration_secs must be <= jwt.refresh_horizon_secs".into(),
            ));
        }
        Ok(())
    }
}

fn default_jwt_issuer() -> String {
    "workspace-auth-gateway".to_string()
}
fn default_jwt_audience() -> String {
    "workspaces".to_string()
}
fn default_jwt_expiration_secs() -> i64 {
    3600
}
fn default_refresh_window_secs() -> i64 {
    900
}
fn default_refresh_horizon_secs() -> i64 {
    12 * 3600
}
fn default_true() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Cookie layer (C4)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct CookieConfig {
    #[serde(default = "default_cookie_name")]
    pub name: String,

    #[serde(default = "default_true")]
    pub secure: bool,

    #[serde(default = "default_true")]
    pub http_only: bool,

    #[serde(default)]
    pub domain: Option<String>,

    /// Fallback `Path` used when the forwarded URL's AppPath extraction
    /// yields empty or `/`.
    #[serde(default = "default_cookie_path")]
    pub path: String,

    #[serde(default = "default_cookie_max_age_secs")]
    pub max_age_secs: i64,

    #[serde(default)]
    pub same_site: SameSite,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: default_cookie_name(),
            secure: true,
            http_only: true,
            domain: None,
            path: default_cookie_path(),
            max_age_secs: default_cookie_max_age_secs(),
            same_site: SameSite::default(),
        }
    }
}

impl CookieConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Validation(
                "cookie.name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_cookie_name() -> String {
    "workspace_session".to_string()
}
fn default_cookie_path() -> String {
    "/".to_string()
}
fn default_cookie_max_age_secs() -> i64 {
    3600
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    #[default]
    Lax,
    Strict,
    None,
}

impl SameSite {
    pub fn to_cookie_same_site(self) -> tower_cookies::cookie::SameSite {
        match self {
            SameSite::Lax => tower_cookies::cookie::SameSite::Lax,
            SameSite::Strict => tower_cookies::cookie::SameSite::Strict,
            SameSite::None => tower_cookies::cookie::SameSite::None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Path extractor (C1)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct PathConfig {
    /// Pattern whose first capture group is the canonical AppPath.
    #[serde(default = "default_app_path_regex")]
    pub app_path_regex: String,

    /// Pattern whose single capture group is the workspace namespace.
    #[serde(default = "default_namespace_regex")]
    pub namespace_regex: String,

    /// Pattern whose single capture group is the workspace name.
    #[serde(default = "default_name_regex")]
    pub name_regex: String,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            app_path_regex: default_app_path_regex(),
            namespace_regex: default_namespace_regex(),
            name_regex: default_name_regex(),
        }
    }
}

impl PathConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        // A pattern that fails to compile is a boot-time configuration error;
        // `extract_app_path`'s fail-open behavior applies only to a path
        // string that doesn't *match* an already-compiled regex.
        regex::Regex::new(&self.app_path_regex)
            .map_err(|e| ConfigError::Validation(format!("path.app_path_regex: {e}")))?;
        regex::Regex::new(&self.namespace_regex)
            .map_err(|e| ConfigError::Validation(format!("path.namespace_regex: {e}")))?;
        regex::Regex::new(&self.name_regex)
            .map_err(|e| ConfigError::Validation(format!("path.name_regex: {e}")))?;
        Ok(())
    }
}

fn default_app_path_regex() -> String {
    r"^(/workspaces/[^/]+/[^/]+)".to_string()
}
fn default_namespace_regex() -> String {
    r"^/workspaces/([^/]+)/[^/]+".to_string()
}
fn default_name_regex() -> String {
    r"^/workspaces/[^/]+/([^/]+)".to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// OIDC verifier (C2)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct OidcConfig {
    pub issuer_url: String,

    pub client_id: String,

    #[serde(default = "default_oidc_init_timeout_secs")]
    pub init_timeout_secs: u64,

    /// How long a cached JWKS entry is trusted before being re-fetched. A
    /// `kid` cache miss forces a re-fetch regardless of this TTL, so key
    /// rotation at the provider is picked up without waiting it out.
    #[serde(default = "default_oidc_jwks_refresh_secs")]
    pub jwks_refresh_secs: u64,

    #[serde(default)]
    pub username_prefix: String,

    #[serde(default)]
    pub groups_prefix: String,
}

impl std::fmt::Debug for OidcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcConfig")
            .field("issuer_url", &self.issuer_url)
            .field("client_id", &self.client_id)
            .field("init_timeout_secs", &self.init_timeout_secs)
            .field("jwks_refresh_secs", &self.jwks_refresh_secs)
            .field("username_prefix", &self.username_prefix)
            .field("groups_prefix", &self.groups_prefix)
            .finish()
    }
}

impl OidcConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.init_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "oidc.init_timeout_secs must be strictly positive".into(),
            ));
        }
        if self.issuer_url.is_empty() {
            return Err(ConfigError::Validation(
                "oidc.issuer_url must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_oidc_init_timeout_secs() -> u64 {
    30
}

fn default_oidc_jwks_refresh_secs() -> u64 {
    3600
}

// ─────────────────────────────────────────────────────────────────────────────
// Access oracle client (C5)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct OracleConfig {
    /// Base URL of the orchestrator's extension API, e.g. `https://kubernetes.default.svc`.
    #[serde(default = "default_oracle_base_url")]
    pub base_url: String,

    #[serde(default = "default_oracle_api_group")]
    pub api_group: String,

    #[serde(default = "default_oracle_api_version")]
    pub api_version: String,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: default_oracle_base_url(),
            api_group: default_oracle_api_group(),
            api_version: default_oracle_api_version(),
        }
    }
}

fn default_oracle_base_url() -> String {
    "https://kubernetes.default.svc".to_string()
}
fn default_oracle_api_group() -> String {
    "workspaces.example.com".to_string()
}
fn default_oracle_api_version() -> String {
    "v1".to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Feature toggles
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct FeatureToggles {
    #[serde(default = "default_true")]
    pub enable_oauth: bool,

    #[serde(default = "default_true")]
    pub enable_bearer_url_auth: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            enable_oauth: true,
            enable_bearer_url_auth: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Observability
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default)]
    pub log_level: LogLevel,

    /// Extra `tracing-subscriber` filter directives appended to the base level,
    /// e.g. `"tower_http=debug"`.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_level: LogLevel::default(),
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Json,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[jwt]
signing_key = "test-signing-key-at-least-32-bytes-long"

[oidc]
issuer_url = "https://issuer.example.com"
client_id = "workspace-proxy"
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = Config::from_str(minimal_toml()).expect("should parse");
        assert_eq!(config.jwt.issuer, "workspace-auth-gateway");
        assert_eq!(config.cookie.name, "workspace_session");
        assert!(config.features.enable_oauth);
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn rejects_unknown_fields() {
        let toml = format!("{}\nbogus_top_level = true\n", minimal_toml());
        let err = Config::from_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_refresh_window_larger_than_expiration() {
        let toml = r#"
[jwt]
signing_key = "k"
expiration_secs = 100
refresh_window_secs = 200

[oidc]
issuer_url = "https://issuer.example.com"
client_id = "c"
"#;
        let err = Config::from_str(toml).unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.contains("refresh_window_secs")),
            other => panic!("expected Validation error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_refresh_horizon_smaller_than_expiration() {
        let toml = r#"
[jwt]
signing_key = "k"
expiration_secs = 1000
refresh_horizon_secs = 100

[oidc]
issuer_url = "https://issuer.example.com"
client_id = "c"
"#;
        let err = Config::from_str(toml).unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.contains("refresh_horizon_secs")),
            other => panic!("expected Validation error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_oidc_init_timeout() {
        let toml = r#"
[jwt]
signing_key = "k"

[oidc]
issuer_url = "https://issuer.example.com"
client_id = "c"
init_timeout_secs = 0
"#;
        let err = Config::from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn debug_impl_redacts_signing_key() {
        let config = Config::from_str(minimal_toml()).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("test-signing-key-at-least-32-bytes-long"));
        assert!(debug.contains("****"));
    }

    #[test]
    fn expands_env_vars() {
        temp_env::with_var("SESSION_SIGNING_KEY", Some("from-env-xyz"), || {
            let toml = r#"
[jwt]
signing_key = "${SESSION_SIGNING_KEY}"

[oidc]
issuer_url = "https://issuer.example.com"
client_id = "c"
"#;
            let config = Config::from_str(toml).unwrap();
            assert_eq!(config.jwt.signing_key, "from-env-xyz");
        });
    }

    #[test]
    fn missing_env_var_is_a_named_error() {
        temp_env::with_var_unset("DEFINITELY_UNSET_VAR_XYZ", || {
            let toml = r#"
[jwt]
signing_key = "${DEFINITELY_UNSET_VAR_XYZ}"

[oidc]
issuer_url = "https://issuer.example.com"
client_id = "c"
"#;
            let err = Config::from_str(toml).unwrap_err();
            match err {
                ConfigError::EnvVarNotFound(name) => assert_eq!(name, "DEFINITELY_UNSET_VAR_XYZ"),
                other => panic!("expected EnvVarNotFound, got {other:?}"),
            }
        });
    }
}
