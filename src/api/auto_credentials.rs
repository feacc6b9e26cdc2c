//! POST /auto-credentials
//!
//! Validates the portal login and hands it to the configured
//! [`CredentialRetriever`](crate::automation::CredentialRetriever).

use super::AppState;
use crate::automation::{AutoCredentialsBody, RetrievalOutcome};
use crate::errors::ApiError;
use crate::rate_limit::{client_key, CallerKey};
use axum::{
    extract::{FromRequest, Request, State},
    response::Json,
};
use serde::Serialize;
use tracing::{error, info};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoCredentialsResponse {
    pub success: bool,
    pub client_id: String,
    pub client_secret: String,
    pub organization_id: Option<String>,
}

pub async fn auto_credentials(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<AutoCredentialsResponse>, ApiError> {
    let caller = req
        .extensions()
        .get::<CallerKey>()
        .map(|key| key.0.clone())
        .unwrap_or_else(|| client_key(&req, false));
    let Json(body) = Json::<AutoCredentialsBody>::from_request(req, &state).await?;

    let request = body.validate().map_err(ApiError::InvalidFields)?;

    info!(caller = %caller, url = %request.url, "Auto-credentials request");

    match state.retriever.retrieve(&request).await {
        RetrievalOutcome::Success {
            client_id,
            client_secret,
            organization_id,
        } => {
            info!(username = %request.username, "Credentials retrieved");
            Ok(Json(AutoCredentialsResponse {
                success: true,
                client_id,
                client_secret,
                organization_id,
            }))
        }
        RetrievalOutcome::Failure { error: message, error_code } => {
            error!(code = ?error_code, error = %message, "Credential retrieval failed");
            Err(ApiError::RetrievalFailed {
                code: error_code,
                message,
            })
        }
    }
}
