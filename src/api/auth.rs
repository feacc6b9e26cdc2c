//! POST /auth/token
//!
//! Browser-facing proxy for the upstream OAuth2 client-credentials grant.

use super::AppState;
use crate::errors::ApiError;
use crate::token_proxy::TokenRequest;
use axum::{
    extract::{rejection::JsonRejection, State},
    response::Json,
};

pub async fn request_token(
    State(state): State<AppState>,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(req) = payload?;
    state.token_proxy.request_token(req).await.map(Json)
}
