//! OAuth2 token proxy
//!
//! Exchanges client credentials for an access token against the management
//! API on behalf of the browser, which cannot call it directly. Outbound
//! calls are paced by a shared [`TokenBucket`] so bursts from the UI never
//! exceed the upstream's published rate.

use crate::errors::{codes, ApiError};
use crate::rate_limit::TokenBucket;
use axum::http::StatusCode;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Upstream request budget
pub const UPSTREAM_REQUESTS_PER_SEC: u32 = 20;

const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Token exchange request body
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub api_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// Upstream error body, as far as we read it
#[derive(Debug, Default, Deserialize)]
struct UpstreamErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

pub struct TokenProxy {
    client: Client,
    pacer: TokenBucket,
}

impl TokenProxy {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_pacer(TokenBucket::per_second(UPSTREAM_REQUESTS_PER_SEC))
    }

    pub fn with_pacer(pacer: TokenBucket) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(TOKEN_TIMEOUT).build()?;
        Ok(Self { client, pacer })
    }

    pub fn pacer(&self) -> &TokenBucket {
        &self.pacer
    }

    /// Exchange client credentials for a token, returning the upstream JSON as-is
    pub async fn request_token(&self, req: TokenRequest) -> Result<serde_json::Value, ApiError> {
        let (api_url, client_id, client_secret) = match (req.api_url, req.client_id, req.client_secret) {
            (Some(u), Some(i), Some(s)) if !u.is_empty() && !i.is_empty() && !s.is_empty() => {
                (u, i, s)
            }
            _ => {
                return Err(ApiError::MissingParameters(
                    "apiUrl, clientId, and clientSecret are required".into(),
                ))
            }
        };

        let token_url = token_url(&api_url)
            .ok_or_else(|| ApiError::InvalidUrl("Invalid apiUrl format".into()))?;

        info!(api_url = %api_url, "Proxying OAuth2 token request");

        let form = [
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];

        let result = self
            .pacer
            .execute(|| self.client.post(token_url).form(&form).send())
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(error = %e, "OAuth2 token request timed out");
                return Err(ApiError::Upstream {
                    status: StatusCode::GATEWAY_TIMEOUT,
                    code: codes::CONNECTION_TIMEOUT,
                    message: e.to_string(),
                });
            }
            Err(e) => {
                warn!(error = %e, "OAuth2 token request failed");
                return Err(ApiError::Upstream {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: codes::NETWORK_ERROR,
                    message: e.to_string(),
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| ApiError::Upstream {
                status: StatusCode::BAD_GATEWAY,
                code: codes::NETWORK_ERROR,
                message: format!("Unreadable token response: {}", e),
            });
        }

        let body: UpstreamErrorBody = response.json().await.unwrap_or_default();
        let message = body
            .error_description
            .or(body.error)
            .unwrap_or_else(|| "OAuth2 token request failed".to_string());
        warn!(%status, error = %message, "OAuth2 token request rejected upstream");

        Err(upstream_error(status, message))
    }
}

/// `<api_url>/api/oauth2/token`, or `None` when `api_url` is not a URL
fn token_url(api_url: &str) -> Option<Url> {
    Url::parse(api_url).ok()?;
    Url::parse(&format!("{}/api/oauth2/token", api_url.trim_end_matches('/'))).ok()
}

fn upstream_error(status: reqwest::StatusCode, message: String) -> ApiError {
    let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    match status.as_u16() {
        401 | 403 => ApiError::Upstream {
            status,
            code: codes::INVALID_CREDENTIALS,
            message: "Invalid client credentials".into(),
        },
        s if s >= 500 => ApiError::Upstream {
            status,
            code: codes::BACKEND_NOT_AVAILABLE,
            message: "Upstream API is unavailable".into(),
        },
        _ => ApiError::Upstream {
            status,
            code: codes::NETWORK_ERROR,
            message,
        },
    }
}
