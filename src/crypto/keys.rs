//! Local signing key material
//!
//! Key files hold a single hex-encoded secp256k1 secret key. Key ids are
//! derived from the compressed public key so any verifier holding the public
//! key can recompute them.

use std::fs;
use std::path::Path;

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{LedgerError, Result};

pub const KEY_ID_PREFIX: &str = "secp256k1:";

/// `secp256k1:` followed by the first 16 hex chars of SHA-256(compressed public key).
pub fn derive_key_id(public_key: &PublicKey) -> String {
    let digest = Sha256::digest(public_key.serialize());
    format!("{}{}", KEY_ID_PREFIX, &hex::encode(digest)[..16])
}

pub fn parse_public_key(hex_key: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| LedgerError::CryptoError(format!("Invalid public key hex: {}", e)))?;
    PublicKey::from_slice(&bytes)
        .map_err(|e| LedgerError::CryptoError(format!("Invalid public key: {}", e)))
}

/// A secret key with its derived public key and id
#[derive(Clone)]
pub struct KeyMaterial {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
    pub key_id: String,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &self.key_id)
            .field("public_key", &hex::encode(self.public_key.serialize()))
            .finish()
    }
}

impl KeyMaterial {
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::signing_only();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        let key_id = derive_key_id(&public_key);
        Self {
            secret_key,
            public_key,
            key_id,
        }
    }

    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        Self::from_secret_key(secret_key)
    }

    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| LedgerError::CryptoError(format!("Invalid secret key hex: {}", e)))?;
        let secret_key = SecretKey::from_slice(&bytes)
            .map_err(|e| LedgerError::CryptoError(format!("Invalid secret key: {}", e)))?;
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            LedgerError::ConfigError(format!("Failed to read signing key {:?}: {}", path, e))
        })?;
        let material = Self::from_hex(&contents)?;
        info!("Loaded signing key {} from {:?}", material.key_id, path);
        Ok(material)
    }

    /// Write the secret key as hex; refuses to overwrite an existing file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if path.exists() {
            return Err(LedgerError::ConfigError(format!(
                "Refusing to overwrite existing key file {:?}",
                path
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                LedgerError::ConfigError(format!("Failed to create key directory: {}", e))
            })?;
        }
        fs::write(path, hex::encode(self.secret_key.secret_bytes())).map_err(|e| {
            LedgerError::ConfigError(format!("Failed to write key file {:?}: {}", path, e))
        })?;
        Ok(())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }
}
