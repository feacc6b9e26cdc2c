//! HTTP API
//!
//! Route handlers. Cross-cutting admission (origin gate, rate limits, CORS)
//! is layered on in [`crate::server`].

pub mod auth;
pub mod auto_credentials;
pub mod credentials;
pub mod health;
pub mod origins;

use crate::automation::CredentialRetriever;
use crate::credentials::CredentialStore;
use crate::origins::OriginStore;
use crate::rate_limit::{rate_limit_middleware, CallerLimiter};
use crate::token_proxy::TokenProxy;
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;

pub use health::{health_check, HealthResponse, SERVICE_NAME};

/// State shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub origins: Arc<dyn OriginStore>,
    pub credentials: Arc<CredentialStore>,
    pub retriever: Arc<dyn CredentialRetriever>,
    pub token_proxy: Arc<TokenProxy>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        origins: Arc<dyn OriginStore>,
        credentials: Arc<CredentialStore>,
        retriever: Arc<dyn CredentialRetriever>,
        token_proxy: Arc<TokenProxy>,
    ) -> Self {
        Self {
            origins,
            credentials,
            retriever,
            token_proxy,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Routes mounted under `/api`
///
/// - GET    /security/origins       - List trusted origins
/// - POST   /security/origins       - Register a trusted origin
/// - DELETE /security/origins/{id}  - Remove a trusted origin
/// - GET    /credentials            - Masked summary of stored credentials
/// - PUT    /credentials            - Store credentials
/// - DELETE /credentials            - Clear stored credentials
/// - POST   /auto-credentials       - Retrieve OAuth credentials (extra limit)
/// - POST   /auth/token             - Proxy an OAuth2 token request
pub fn api_router(state: AppState, sensitive: Arc<CallerLimiter>) -> Router {
    let retrieval = Router::new()
        .route("/auto-credentials", post(auto_credentials::auto_credentials))
        .route_layer(middleware::from_fn_with_state(
            sensitive,
            rate_limit_middleware,
        ));

    Router::new()
        .route(
            "/security/origins",
            get(origins::list_origins).post(origins::add_origin),
        )
        .route("/security/origins/{id}", delete(origins::remove_origin))
        .route(
            "/credentials",
            get(credentials::get_credentials)
                .put(credentials::save_credentials)
                .delete(credentials::clear_credentials),
        )
        .route("/auth/token", post(auth::request_token))
        .merge(retrieval)
        .with_state(state)
}
