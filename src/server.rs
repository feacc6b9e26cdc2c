//! HTTP Server
//!
//! Axum server with origin gating, per-caller rate limits, CORS and graceful
//! shutdown.
//!
//! Request path, outermost first:
//!
//! ```text
//! Trace ─► Security headers ─► Origin Gate ─► CORS ─► General limiter ─► Router
//!                                                                  └─► /api/auto-credentials
//!                                                                       (sensitive limiter)
//! ```

use crate::api::{api_router, health_check, AppState};
use crate::automation::{CredentialRetriever, HttpCredentialRetriever, UnconfiguredRetriever};
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::origin_gate::{origin_gate_middleware, OriginGate};
use crate::origins::{JsonFileOriginStore, OriginStore};
use crate::rate_limit::{rate_limit_middleware, CallerLimiter, RateLimitConfig};
use crate::storage::{FileSlotStorage, SlotStorage};
use crate::token_proxy::TokenProxy;
use crate::vault::{CipherVault, KeySource, PassphraseKeySource, StoredKeySource};
use axum::{
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Flow backend server
pub struct FlowServer {
    config: Config,
    state: AppState,
    gate: Arc<OriginGate>,
    general: Arc<CallerLimiter>,
    sensitive: Arc<CallerLimiter>,
}

impl FlowServer {
    /// Assemble a server around already-built stores
    pub fn new(config: Config, state: AppState) -> Self {
        let gate = OriginGate::new(config.frontend_port, state.origins.clone())
            .open(config.origin_gate_open());
        let general = CallerLimiter::new("general", RateLimitConfig::general())
            .trusting_proxy(config.trust_proxy);
        let sensitive = CallerLimiter::new(
            "auto-credentials",
            RateLimitConfig::auto_credentials().skipped(config.rate_limit_skipped()),
        )
        .trusting_proxy(config.trust_proxy);

        Self {
            config,
            state,
            gate: Arc::new(gate),
            general: Arc::new(general),
            sensitive: Arc::new(sensitive),
        }
    }

    /// Build file-backed stores from configuration
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let storage: Arc<dyn SlotStorage> = Arc::new(FileSlotStorage::new(&config.data_dir));

        let keys: Arc<dyn KeySource> = match &config.vault_passphrase {
            Some(passphrase) => {
                info!("Vault key derived from passphrase");
                Arc::new(PassphraseKeySource::new(storage.clone(), passphrase))
            }
            None => Arc::new(StoredKeySource::new(storage.clone())),
        };
        let vault = CipherVault::new(keys);
        if let Err(e) = vault.get_or_create_key().await {
            // Keep serving: stored credentials read as absent and saves fail
            // until DELETE /api/credentials discards the unusable key
            error!(error = %e, "Vault key unavailable");
        }

        let origins: Arc<dyn OriginStore> =
            Arc::new(JsonFileOriginStore::new(&config.origins_file));
        let credentials = Arc::new(CredentialStore::new(storage, vault));

        let retriever: Arc<dyn CredentialRetriever> = match &config.automation_url {
            Some(url) => Arc::new(HttpCredentialRetriever::new(url)?),
            None => {
                warn!("AUTOMATION_URL not set, credential retrieval disabled");
                Arc::new(UnconfiguredRetriever)
            }
        };

        let token_proxy = Arc::new(TokenProxy::new()?);
        let state = AppState::new(origins, credentials, retriever, token_proxy);
        Ok(Self::new(config, state))
    }

    /// Build the router with all routes and middleware
    pub fn build_router(&self) -> Router {
        // Mirror the caller's origin; the gate has already vetted it
        let cors = CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_credentials(true)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .expose_headers([
                header::RETRY_AFTER,
                HeaderName::from_static("ratelimit-limit"),
                HeaderName::from_static("ratelimit-remaining"),
                HeaderName::from_static("ratelimit-reset"),
            ]);

        let mut router = Router::new()
            .route("/health", get(health_check))
            .with_state(self.state.clone())
            .nest("/api", api_router(self.state.clone(), self.sensitive.clone()))
            .fallback(not_found)
            .layer(middleware::from_fn_with_state(
                self.general.clone(),
                rate_limit_middleware,
            ))
            .layer(cors)
            .layer(middleware::from_fn_with_state(
                self.gate.clone(),
                origin_gate_middleware,
            ))
            .layer(SetResponseHeaderLayer::if_not_present(
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            ))
            .layer(SetResponseHeaderLayer::if_not_present(
                header::X_FRAME_OPTIONS,
                HeaderValue::from_static("DENY"),
            ))
            .layer(SetResponseHeaderLayer::if_not_present(
                header::REFERRER_POLICY,
                HeaderValue::from_static("no-referrer"),
            ));

        if self.config.log_requests {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Start the server and run until shutdown signal
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let router = self.build_router();

        info!("Starting Flow backend on {}", addr);
        info!(
            environment = ?self.config.environment,
            frontend_port = self.config.frontend_port,
            origins_file = %self.config.origins_file.display(),
            "Origin policy loaded"
        );

        if self.config.origin_gate_open() {
            warn!("ALLOW_ANY_ORIGIN_IN_DEV set - origin gate is open");
        }
        if self.config.rate_limit_skipped() {
            warn!("SKIP_RATE_LIMIT set - credential retrieval is not rate limited");
        }
        if self.config.trust_proxy {
            info!("TRUST_PROXY set - callers keyed by forwarding headers");
        }
        if !self.config.is_localhost() {
            warn!("Backend bound to {} - reachable from the network", addr);
        }

        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        info!(
            rejected_origins = self.gate.rejections(),
            "Flow backend shut down gracefully"
        );
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gate(&self) -> &OriginGate {
        &self.gate
    }

    pub fn general_limiter(&self) -> &CallerLimiter {
        &self.general
    }

    pub fn sensitive_limiter(&self) -> &CallerLimiter {
        &self.sensitive
    }
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Not found" })),
    )
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
