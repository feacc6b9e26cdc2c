//! Cipher Vault
//!
//! AES-256-GCM key lifecycle and authenticated encryption of arbitrary payloads.
//!
//! # Trust model
//!
//! With the default [`StoredKeySource`] the exported key lives in the same slot
//! storage as the ciphertext it protects. Anyone who can read that storage can
//! recover both. This guards against casual inspection and accidental leakage
//! (logs, backups, screenshots of config files), not against an adversary with
//! local read access. Losing the key slot makes all prior ciphertext
//! unrecoverable; there is no backup mechanism.
//!
//! [`PassphraseKeySource`] derives the key from a user passphrase instead and
//! plugs in behind the same [`KeySource`] trait.

use crate::storage::{SlotStorage, StorageError};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use argon2::Argon2;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Key length in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes (96-bit GCM nonce)
pub const NONCE_LEN: usize = 12;

/// Salt length for passphrase derivation
const SALT_LEN: usize = 16;

/// Default slot holding the exported key
pub const DEFAULT_KEY_SLOT: &str = "flow_encryption_key";

/// Default slot holding the passphrase salt
pub const DEFAULT_SALT_SLOT: &str = "flow_encryption_salt";

/// Vault errors
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key material: {0}")]
    InvalidKey(String),
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A 256-bit AES-GCM key, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey([u8; KEY_LEN]);

impl VaultKey {
    /// Generate a fresh key from the OS RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Import a key from its exported (base64) representation
    pub fn import(exported: &str) -> Result<Self, VaultError> {
        let decoded = Zeroizing::new(
            BASE64
                .decode(exported.trim())
                .map_err(|e| VaultError::InvalidKey(e.to_string()))?,
        );

        if decoded.len() != KEY_LEN {
            return Err(VaultError::InvalidKey(format!(
                "expected {} bytes, found {}",
                KEY_LEN,
                decoded.len()
            )));
        }

        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Export the key to a durable base64 representation
    pub fn export(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(self.0))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey(<redacted>)")
    }
}

/// Nonce and ciphertext, each base64-encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub iv: String,
    pub data: String,
}

/// Encrypt bytes under a fresh random nonce
pub fn encrypt(key: &VaultKey, plaintext: &[u8]) -> Result<EncryptedBlob, VaultError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(nonce, plaintext)
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

    Ok(EncryptedBlob {
        iv: BASE64.encode(nonce_bytes),
        data: BASE64.encode(&ciphertext),
    })
}

/// Decrypt and authenticate a blob. Any tampering yields `DecryptionFailed`.
pub fn decrypt(key: &VaultKey, blob: &EncryptedBlob) -> Result<Vec<u8>, VaultError> {
    let nonce_bytes = BASE64
        .decode(&blob.iv)
        .map_err(|_| VaultError::DecryptionFailed)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(VaultError::DecryptionFailed);
    }
    let ciphertext = BASE64
        .decode(&blob.data)
        .map_err(|_| VaultError::DecryptionFailed)?;

    key.cipher()
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| VaultError::DecryptionFailed)
}

/// Where the vault key comes from
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn load_or_create(&self) -> Result<VaultKey, VaultError>;

    /// Forget the persisted key material so the next load starts fresh
    async fn discard(&self) -> Result<(), VaultError>;
}

/// Key generated once and exported into a storage slot
pub struct StoredKeySource {
    storage: Arc<dyn SlotStorage>,
    slot: String,
    init: Mutex<()>,
}

impl StoredKeySource {
    pub fn new(storage: Arc<dyn SlotStorage>) -> Self {
        Self::with_slot(storage, DEFAULT_KEY_SLOT)
    }

    pub fn with_slot(storage: Arc<dyn SlotStorage>, slot: &str) -> Self {
        Self {
            storage,
            slot: slot.to_string(),
            init: Mutex::new(()),
        }
    }
}

#[async_trait]
impl KeySource for StoredKeySource {
    async fn load_or_create(&self) -> Result<VaultKey, VaultError> {
        // Serialize first-time creation so concurrent callers agree on one key
        let _guard = self.init.lock().await;

        if let Some(exported) = self.storage.get(&self.slot).await? {
            let exported = Zeroizing::new(exported);
            return VaultKey::import(&exported);
        }

        let key = VaultKey::generate();
        self.storage.set(&self.slot, &key.export()).await?;
        info!(slot = %self.slot, "Generated new vault key");

        Ok(key)
    }

    async fn discard(&self) -> Result<(), VaultError> {
        let _guard = self.init.lock().await;
        self.storage.remove(&self.slot).await?;
        Ok(())
    }
}

/// Key derived from a passphrase with Argon2id and a persisted salt
pub struct PassphraseKeySource {
    storage: Arc<dyn SlotStorage>,
    salt_slot: String,
    passphrase: Zeroizing<String>,
    derived: Mutex<Option<VaultKey>>,
}

impl PassphraseKeySource {
    pub fn new(storage: Arc<dyn SlotStorage>, passphrase: &str) -> Self {
        Self {
            storage,
            salt_slot: DEFAULT_SALT_SLOT.to_string(),
            passphrase: Zeroizing::new(passphrase.to_string()),
            derived: Mutex::new(None),
        }
    }

    async fn load_or_create_salt(&self) -> Result<Vec<u8>, VaultError> {
        if let Some(encoded) = self.storage.get(&self.salt_slot).await? {
            return BASE64
                .decode(encoded.trim())
                .map_err(|e| VaultError::InvalidKey(format!("salt: {}", e)));
        }

        let mut salt = vec![0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        self.storage
            .set(&self.salt_slot, &BASE64.encode(&salt))
            .await?;
        info!(slot = %self.salt_slot, "Generated new passphrase salt");

        Ok(salt)
    }
}

#[async_trait]
impl KeySource for PassphraseKeySource {
    async fn load_or_create(&self) -> Result<VaultKey, VaultError> {
        let mut derived = self.derived.lock().await;
        if let Some(key) = derived.as_ref() {
            return Ok(key.clone());
        }

        let salt = self.load_or_create_salt().await?;
        let passphrase = self.passphrase.clone();

        // Argon2 is deliberately slow; keep it off the async workers
        let key = tokio::task::spawn_blocking(move || {
            let mut bytes = [0u8; KEY_LEN];
            Argon2::default()
                .hash_password_into(passphrase.as_bytes(), &salt, &mut bytes)
                .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;
            Ok::<_, VaultError>(VaultKey(bytes))
        })
        .await
        .map_err(|e| VaultError::KeyDerivation(e.to_string()))??;

        *derived = Some(key.clone());
        Ok(key)
    }

    async fn discard(&self) -> Result<(), VaultError> {
        let mut derived = self.derived.lock().await;
        self.storage.remove(&self.salt_slot).await?;
        *derived = None;
        Ok(())
    }
}

/// Symmetric vault over a pluggable key source
#[derive(Clone)]
pub struct CipherVault {
    keys: Arc<dyn KeySource>,
}

impl CipherVault {
    pub fn new(keys: Arc<dyn KeySource>) -> Self {
        Self { keys }
    }

    /// Vault whose key is exported into `storage` under the default slot
    pub fn with_stored_key(storage: Arc<dyn SlotStorage>) -> Self {
        Self::new(Arc::new(StoredKeySource::new(storage)))
    }

    /// Import the persisted key, or create and persist one on first use
    pub async fn get_or_create_key(&self) -> Result<VaultKey, VaultError> {
        self.keys.load_or_create().await
    }

    /// Replace key material that can no longer be imported.
    ///
    /// Anything sealed under an unreadable key is already lost, so dropping the
    /// slot loses nothing further. Returns whether a key was discarded.
    pub async fn discard_unusable_key(&self) -> Result<bool, VaultError> {
        match self.keys.load_or_create().await {
            Ok(_) => Ok(false),
            Err(VaultError::InvalidKey(reason)) => {
                warn!(reason = %reason, "Discarding unusable vault key");
                self.keys.discard().await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Serialize a value to JSON and encrypt it
    pub async fn seal<T: Serialize>(&self, value: &T) -> Result<EncryptedBlob, VaultError> {
        let key = self.get_or_create_key().await?;
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        encrypt(&key, &plaintext)
    }

    /// Decrypt a blob and deserialize the JSON payload
    pub async fn open<T: DeserializeOwned>(&self, blob: &EncryptedBlob) -> Result<T, VaultError> {
        let key = self.get_or_create_key().await?;
        let plaintext = Zeroizing::new(decrypt(&key, blob)?);
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
