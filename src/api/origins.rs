//! Trusted origin management
//!
//! - GET    /security/origins      list registered origins
//! - POST   /security/origins      register an origin
//! - DELETE /security/origins/{id} remove an origin

use super::AppState;
use crate::errors::ApiError;
use crate::origins::TrustedOrigin;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Deserialize)]
pub struct AddOriginRequest {
    pub origin: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OriginListResponse {
    pub success: bool,
    pub origins: Vec<TrustedOrigin>,
}

#[derive(Debug, Serialize)]
pub struct OriginResponse {
    pub success: bool,
    pub origin: TrustedOrigin,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

pub async fn list_origins(
    State(state): State<AppState>,
) -> Result<Json<OriginListResponse>, ApiError> {
    let origins = state.origins.list().await?;
    Ok(Json(OriginListResponse {
        success: true,
        origins,
    }))
}

pub async fn add_origin(
    State(state): State<AppState>,
    payload: Result<Json<AddOriginRequest>, JsonRejection>,
) -> Result<Json<OriginResponse>, ApiError> {
    let Json(req) = payload?;

    let origin = req
        .origin
        .filter(|o| !o.is_empty())
        .ok_or_else(|| ApiError::MissingParameters("Origin is required".into()))?;

    if Url::parse(&origin).is_err() {
        return Err(ApiError::InvalidUrl("Invalid origin URL format".into()));
    }

    let record = state
        .origins
        .add(&origin, req.description.as_deref())
        .await?;

    Ok(Json(OriginResponse {
        success: true,
        origin: record,
    }))
}

pub async fn remove_origin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    if !state.origins.remove(&id).await? {
        return Err(ApiError::NotFound("Origin".into()));
    }

    Ok(Json(MessageResponse {
        success: true,
        message: "Origin removed successfully".into(),
    }))
}
