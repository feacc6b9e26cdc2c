//! Credential retrieval collaborator
//!
//! Signing in to the management portal and reading back the OAuth client
//! credentials happens outside this crate. The HTTP layer only validates the
//! request and hands it to a [`CredentialRetriever`].

use crate::errors::{codes, FieldError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Application name registered when the caller does not supply one
pub const DEFAULT_APP_NAME: &str = "Flow - Device Monitor";

/// Upper bound for one retrieval run
const RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Raw request body before validation
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoCredentialsBody {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub app_name: Option<String>,
}

/// Validated retrieval request
#[derive(Clone, Serialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct AutoCredentialsRequest {
    pub url: String,
    pub username: String,
    pub password: String,
    pub app_name: String,
}

impl fmt::Debug for AutoCredentialsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoCredentialsRequest")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("app_name", &self.app_name)
            .finish()
    }
}

impl AutoCredentialsBody {
    /// Check every field, reporting all failures at once
    pub fn validate(self) -> Result<AutoCredentialsRequest, Vec<FieldError>> {
        let mut errors = Vec::new();

        let url = self.url.unwrap_or_default();
        if Url::parse(&url).is_err() {
            errors.push(FieldError::new("url", "Invalid URL format"));
        }

        let username = self.username.unwrap_or_default();
        if username.is_empty() {
            errors.push(FieldError::new("username", "Username is required"));
        }

        let password = self.password.unwrap_or_default();
        if password.is_empty() {
            errors.push(FieldError::new("password", "Password is required"));
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(AutoCredentialsRequest {
            url,
            username,
            password,
            app_name: self.app_name.unwrap_or_else(|| DEFAULT_APP_NAME.to_string()),
        })
    }
}

/// Result of a retrieval run
#[derive(Clone, PartialEq, Eq)]
pub enum RetrievalOutcome {
    Success {
        client_id: String,
        client_secret: String,
        organization_id: Option<String>,
    },
    Failure {
        error: String,
        error_code: Option<String>,
    },
}

impl fmt::Debug for RetrievalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalOutcome::Success {
                client_id,
                organization_id,
                ..
            } => f
                .debug_struct("Success")
                .field("client_id", client_id)
                .field("client_secret", &"[REDACTED]")
                .field("organization_id", organization_id)
                .finish(),
            RetrievalOutcome::Failure { error, error_code } => f
                .debug_struct("Failure")
                .field("error", error)
                .field("error_code", error_code)
                .finish(),
        }
    }
}

impl RetrievalOutcome {
    pub fn failure(code: &str, error: impl Into<String>) -> Self {
        RetrievalOutcome::Failure {
            error: error.into(),
            error_code: Some(code.to_string()),
        }
    }
}

/// Something that can turn portal credentials into OAuth client credentials
#[async_trait]
pub trait CredentialRetriever: Send + Sync {
    async fn retrieve(&self, request: &AutoCredentialsRequest) -> RetrievalOutcome;
}

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("Invalid automation endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Wire shape returned by the automation sidecar
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SidecarResponse {
    success: bool,
    client_id: Option<String>,
    client_secret: Option<String>,
    organization_id: Option<String>,
    error: Option<String>,
    error_code: Option<String>,
}

impl From<SidecarResponse> for RetrievalOutcome {
    fn from(resp: SidecarResponse) -> Self {
        match (resp.success, resp.client_id, resp.client_secret) {
            (true, Some(client_id), Some(client_secret)) => RetrievalOutcome::Success {
                client_id,
                client_secret,
                organization_id: resp.organization_id,
            },
            (true, _, _) => RetrievalOutcome::failure(
                codes::OAUTH_TOKEN_NOT_FOUND,
                "Automation reported success without credentials",
            ),
            (false, _, _) => RetrievalOutcome::Failure {
                error: resp
                    .error
                    .unwrap_or_else(|| "Failed to retrieve credentials".to_string()),
                error_code: resp.error_code,
            },
        }
    }
}

/// Forwards retrieval requests to an automation sidecar over HTTP
pub struct HttpCredentialRetriever {
    client: Client,
    endpoint: Url,
}

impl HttpCredentialRetriever {
    pub fn new(endpoint: &str) -> Result<Self, AutomationError> {
        let endpoint =
            Url::parse(endpoint).map_err(|e| AutomationError::InvalidEndpoint(e.to_string()))?;
        let client = Client::builder().timeout(RETRIEVAL_TIMEOUT).build()?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl CredentialRetriever for HttpCredentialRetriever {
    async fn retrieve(&self, request: &AutoCredentialsRequest) -> RetrievalOutcome {
        debug!(endpoint = %self.endpoint, url = %request.url, "Forwarding credential retrieval");

        let response = match self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(error = %e, "Automation sidecar timed out");
                return RetrievalOutcome::failure(codes::AUTOMATION_TIMEOUT, e.to_string());
            }
            Err(e) => {
                warn!(error = %e, "Automation sidecar unreachable");
                return RetrievalOutcome::failure(codes::BROWSER_LAUNCH_FAILED, e.to_string());
            }
        };

        let status = response.status();
        match response.json::<SidecarResponse>().await {
            Ok(body) => body.into(),
            Err(e) => {
                warn!(%status, error = %e, "Unreadable automation response");
                RetrievalOutcome::failure(
                    codes::NETWORK_ERROR,
                    format!("Unexpected automation response ({})", status),
                )
            }
        }
    }
}

/// Used when no automation endpoint is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredRetriever;

#[async_trait]
impl CredentialRetriever for UnconfiguredRetriever {
    async fn retrieve(&self, _request: &AutoCredentialsRequest) -> RetrievalOutcome {
        RetrievalOutcome::failure(
            codes::BROWSER_LAUNCH_FAILED,
            "Credential automation is not configured",
        )
    }
}
