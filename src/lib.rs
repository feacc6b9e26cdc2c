//! Flow Guard
//!
//! Access-control and credential-protection core of the Flow network
//! dashboard backend.
//!
//! # Features
//!
//! - **Credential Vault**: AES-256-GCM encryption of stored API credentials
//! - **Origin Registry**: Persisted, runtime-editable cross-origin allow-list
//! - **Origin Gate**: Per-request admission against the frontend port and registry
//! - **Admission Control**: Token buckets per caller and per sensitive route
//! - **Token Proxy**: Paced OAuth2 token exchange against the upstream API
//!
//! # Architecture
//!
//! ```text
//! Browser ──► Origin Gate ──► CORS ──► Rate Limiter ──► Handlers
//!                 │                                        │
//!                 └── Origin Registry (JSON file) ◄────────┤
//!                                                          ├── Credential Store
//!                                                          │     └── Cipher Vault ── Slot Storage
//!                                                          ├── Credential Retriever (sidecar)
//!                                                          └── Token Proxy ──► Upstream API
//! ```

pub mod api;
pub mod automation;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod origin_gate;
pub mod origins;
pub mod rate_limit;
pub mod server;
pub mod storage;
pub mod token_proxy;
pub mod vault;

pub use api::AppState;
pub use automation::{
    AutoCredentialsRequest, CredentialRetriever, HttpCredentialRetriever, RetrievalOutcome,
    UnconfiguredRetriever,
};
pub use config::{Config, Environment};
pub use credentials::{mask, CredentialBundle, CredentialStore, CredentialSummary};
pub use errors::{ApiError, ErrorResponse};
pub use origin_gate::{GateDecision, GateRejection, OriginGate};
pub use origins::{JsonFileOriginStore, MemoryOriginStore, OriginStore, TrustedOrigin};
pub use rate_limit::{CallerKey, CallerLimiter, RateLimitConfig, TokenBucket};
pub use server::FlowServer;
pub use storage::{FileSlotStorage, MemorySlotStorage, SlotStorage};
pub use token_proxy::TokenProxy;
pub use vault::{CipherVault, EncryptedBlob, VaultError, VaultKey};
