//! Credential Store
//!
//! Persists a single encrypted API credential bundle in slot storage.
//! A corrupted or undecryptable slot reads back as "no credentials".

use crate::storage::{SlotStorage, StorageError};
use crate::vault::{CipherVault, EncryptedBlob, VaultError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Slot holding the encrypted bundle
pub const CREDENTIALS_SLOT: &str = "flow_credentials";

/// Default InControl2 cloud endpoint
pub const DEFAULT_API_URL: &str = "https://incontrol2.peplink.com";

/// Longest mask returned for display
const MASK_MAX_LEN: usize = 20;

/// API credentials for the upstream controller
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct CredentialBundle {
    pub api_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub is_custom_endpoint: bool,
}

impl CredentialBundle {
    /// Build a bundle, flagging any endpoint other than the default cloud as custom
    pub fn new(api_url: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            api_url: api_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            is_custom_endpoint: api_url.trim_end_matches('/') != DEFAULT_API_URL,
        }
    }
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("api_url", &self.api_url)
            .field("client_id", &mask(&self.client_id))
            .field("client_secret", &mask(&self.client_secret))
            .field("is_custom_endpoint", &self.is_custom_endpoint)
            .finish()
    }
}

/// Display-safe view of a stored bundle
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub stored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_custom_endpoint: Option<bool>,
}

impl CredentialSummary {
    pub fn absent() -> Self {
        Self {
            stored: false,
            api_url: None,
            client_id: None,
            client_secret: None,
            is_custom_endpoint: None,
        }
    }
}

impl From<&CredentialBundle> for CredentialSummary {
    fn from(bundle: &CredentialBundle) -> Self {
        Self {
            stored: true,
            api_url: Some(bundle.api_url.clone()),
            client_id: Some(mask(&bundle.client_id)),
            client_secret: Some(mask(&bundle.client_secret)),
            is_custom_endpoint: Some(bundle.is_custom_endpoint),
        }
    }
}

/// Mask a secret for display. Length is capped so long secrets are not revealed.
pub fn mask(secret: &str) -> String {
    "•".repeat(secret.chars().count().min(MASK_MAX_LEN))
}

/// Single-slot encrypted credential store
#[derive(Clone)]
pub struct CredentialStore {
    storage: Arc<dyn SlotStorage>,
    vault: CipherVault,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn SlotStorage>, vault: CipherVault) -> Self {
        Self { storage, vault }
    }

    /// Encrypt and store a bundle, replacing any previous one
    pub async fn save(&self, bundle: &CredentialBundle) -> Result<(), VaultError> {
        let blob = self.vault.seal(bundle).await?;
        let encoded = serde_json::to_string(&blob)?;
        self.storage.set(CREDENTIALS_SLOT, &encoded).await?;

        info!(api_url = %bundle.api_url, "Credentials saved");
        Ok(())
    }

    /// Load the stored bundle. Unreadable or tampered data yields `None`.
    pub async fn load(&self) -> Option<CredentialBundle> {
        let stored = match self.storage.get(CREDENTIALS_SLOT).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read credential slot");
                return None;
            }
        };

        let blob: EncryptedBlob = match serde_json::from_str(&stored) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "Stored credentials are not a valid blob");
                return None;
            }
        };

        match self.vault.open(&blob).await {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!(error = %e, "Failed to decrypt credentials");
                None
            }
        }
    }

    /// Check for stored credentials without decrypting them
    pub async fn has(&self) -> Result<bool, StorageError> {
        self.storage.contains(CREDENTIALS_SLOT).await
    }

    /// Remove stored credentials, along with a vault key that no longer imports
    pub async fn clear(&self) -> Result<(), StorageError> {
        self.storage.remove(CREDENTIALS_SLOT).await?;
        info!("Credentials cleared");

        if let Err(e) = self.vault.discard_unusable_key().await {
            warn!(error = %e, "Vault key could not be checked after clear");
        }
        Ok(())
    }

    /// Masked summary of the stored bundle
    pub async fn summary(&self) -> CredentialSummary {
        match self.load().await {
            Some(bundle) => CredentialSummary::from(&bundle),
            None => CredentialSummary::absent(),
        }
    }
}
