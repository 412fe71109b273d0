//! Process-wide shared state, built once at boot and handed to every
//! request handler behind an `Arc`. Nothing here is request-scoped.

use std::sync::Arc;

use regex::Regex;

use crate::auth::oidc::{HttpOidcVerifier, OidcVerifier};
use crate::auth::session::SessionEngine;
use crate::authz::oracle::{AccessOracleClient, HttpOracleClient};
use crate::config::Config;

pub struct AppState {
    pub config: Arc<Config>,
    pub oidc: Arc<dyn OidcVerifier>,
    pub session_engine: Arc<SessionEngine>,
    pub oracle: Arc<dyn AccessOracleClient>,
    pub app_path_regex: Regex,
    pub namespace_regex: Regex,
    pub name_regex: Regex,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, String> {
        let http_client = config
            .http_client
            .build_client()
            .map_err(|e| format!("failed to build http client: {e}"))?;

        let app_path_regex = Regex::new(&config.path.app_path_regex)
            .map_err(|e| format!("invalid app_path_regex: {e}"))?;
        let namespace_regex = Regex::new(&config.path.namespace_regex)
            .map_err(|e| format!("invalid namespace_regex: {e}"))?;
        let name_regex = Regex::new(&config.path.name_regex)
            .map_err(|e| format!("invalid name_regex: {e}"))?;

        let session_engine = Arc::new(SessionEngine::new(&config.jwt));
        let oidc: Arc<dyn OidcVerifier> =
            Arc::new(HttpOidcVerifier::new(http_client.clone(), config.oidc.clone()));
        let oracle: Arc<dyn AccessOracleClient> =
            Arc::new(HttpOracleClient::new(http_client, config.oracle.clone()));

        Ok(Self {
            config: Arc::new(config),
            oidc,
            session_engine,
            oracle,
            app_path_regex,
            namespace_regex,
            name_regex,
        })
    }
}
