//! C5 — Access Oracle Client.
//!
//! Submits a `ConnectionAccessReview` to the orchestrator's extension API and
//! interprets `{allowed, notFound, reason}`. A workspace's access type is
//! owned by the workspace controller and can change independently;
//! duplicating its policy here would race with it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::auth::AuthError;
use crate::config::OracleConfig;

#[derive(Debug, Serialize)]
struct ReviewRequest {
    kind: &'static str,
    #[serde(rename = "apiVersion")]
    api_version: String,
    metadata: ReviewMetadata,
    spec: ReviewSpec,
}

#[derive(Debug, Serialize)]
struct ReviewMetadata {
    namespace: String,
}

#[derive(Debug, Serialize)]
struct ReviewSpec {
    #[serde(rename = "workspaceName")]
    workspace_name: String,
    user: String,
    groups: Vec<String>,
    uid: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    extra: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    status: ReviewStatus,
}

#[derive(Debug, Deserialize)]
struct ReviewStatus {
    allowed: bool,
    #[serde(default, rename = "notFound")]
    not_found: bool,
    #[serde(default)]
    reason: String,
}

/// The result of a connection access review.
#[derive(Debug, Clone)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: String,
}

impl AccessDecision {
    /// `notFound` implies denial regardless of `allowed`: the service cannot
    /// distinguish "no such workspace" from "you're not allowed to know it
    /// exists" without leaking information.
    fn from_response(response: ReviewResponse) -> Self {
        let allowed = response.status.allowed && !response.status.not_found;
        Self {
            allowed,
            reason: response.status.reason,
        }
    }
}

/// Asks an external oracle whether a principal may connect to a workspace.
/// The real implementation is a Kubernetes-extension-API HTTP client; tests
/// substitute a canned-response double.
#[async_trait::async_trait]
pub trait AccessOracleClient: Send + Sync {
    async fn review(
        &self,
        namespace: &str,
        workspace_name: &str,
        user: &str,
        groups: &[String],
        uid: &str,
        extra: &HashMap<String, Vec<String>>,
    ) -> Result<AccessDecision, AuthError>;
}

pub struct HttpOracleClient {
    http_client: reqwest::Client,
    config: OracleConfig,
}

impl HttpOracleClient {
    pub fn new(http_client: reqwest::Client, config: OracleConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }
}

#[async_trait::async_trait]
impl AccessOracleClient for HttpOracleClient {
    /// Asks the oracle whether `(user, groups, uid)` may connect to
    /// `workspace_name` in `namespace`. Transport failures and non-2xx
    /// responses surface as `OracleUnreachable` (server-fault, retriable).
    async fn review(
        &self,
        namespace: &str,
        workspace_name: &str,
        user: &str,
        groups: &[String],
        uid: &str,
        extra: &HashMap<String, Vec<String>>,
    ) -> Result<AccessDecision, AuthError> {
        let url = format!(
            "{}/apis/{}/{}/namespaces/{}/connectionaccessreview",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_group,
            self.config.api_version,
            namespace,
        );

        let body = ReviewRequest {
            kind: "ConnectionAccessReview",
            api_version: format!("{}/{}", self.config.api_group, self.config.api_version),
            metadata: ReviewMetadata {
                namespace: namespace.to_string(),
            },
            spec: ReviewSpec {
                workspace_name: workspace_name.to_string(),
                user: user.to_string(),
                groups: groups.to_vec(),
                uid: uid.to_string(),
                extra: extra.clone(),
            },
        };

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::OracleUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::OracleUnreachable(format!(
                "oracle returned {}",
                response.status()
            )));
        }

        let parsed = response
            .json::<ReviewResponse>()
            .await
            .map_err(|e| AuthError::OracleUnreachable(format!("malformed response: {e}")))?;

        Ok(AccessDecision::from_response(parsed))
    }
}
