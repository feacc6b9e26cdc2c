//! Server-side credential slot
//!
//! The stored secret never leaves the process in clear text; reads return a
//! masked summary.

use super::origins::MessageResponse;
use super::AppState;
use crate::credentials::{CredentialBundle, CredentialSummary, DEFAULT_API_URL};
use crate::errors::ApiError;
use axum::{
    extract::{rejection::JsonRejection, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use url::Url;
use zeroize::Zeroize;

#[derive(Deserialize, Zeroize)]
#[serde(rename_all = "camelCase")]
pub struct SaveCredentialsRequest {
    pub api_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CredentialsResponse {
    pub success: bool,
    #[serde(flatten)]
    pub summary: CredentialSummary,
}

/// Check a save request and build the bundle it describes
pub fn validate_bundle(req: &SaveCredentialsRequest) -> Result<CredentialBundle, ApiError> {
    let client_id = req.client_id.as_deref().unwrap_or_default().trim();
    let client_secret = req.client_secret.as_deref().unwrap_or_default().trim();
    if client_id.is_empty() || client_secret.is_empty() {
        return Err(ApiError::MissingParameters(
            "clientId and clientSecret are required".into(),
        ));
    }

    let api_url = req
        .api_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .unwrap_or(DEFAULT_API_URL);
    match Url::parse(api_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        _ => return Err(ApiError::InvalidUrl("Invalid apiUrl format".into())),
    }

    Ok(CredentialBundle::new(api_url, client_id, client_secret))
}

pub async fn get_credentials(State(state): State<AppState>) -> Json<CredentialsResponse> {
    Json(CredentialsResponse {
        success: true,
        summary: state.credentials.summary().await,
    })
}

pub async fn save_credentials(
    State(state): State<AppState>,
    payload: Result<Json<SaveCredentialsRequest>, JsonRejection>,
) -> Result<Json<CredentialsResponse>, ApiError> {
    let Json(mut req) = payload?;
    let bundle = validate_bundle(&req);
    req.zeroize();
    let bundle = bundle?;

    state.credentials.save(&bundle).await?;
    Ok(Json(CredentialsResponse {
        success: true,
        summary: CredentialSummary::from(&bundle),
    }))
}

pub async fn clear_credentials(
    State(state): State<AppState>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.credentials.clear().await?;
    Ok(Json(MessageResponse {
        success: true,
        message: "Credentials cleared".into(),
    }))
}
