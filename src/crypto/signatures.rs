use std::collections::HashMap;

use async_trait::async_trait;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1};
use sha2::{Digest, Sha256};

use super::keys::{derive_key_id, KeyMaterial};
use super::{SignatureEnvelope, Signer};
use crate::error::{LedgerError, Result};

/// In-process secp256k1 signer for deployments without a remote KMS.
///
/// Signs SHA-256(message) with ECDSA and hex-encodes the compact signature.
/// Public keys of retired keys can be added to the keyring so rows signed
/// before a rotation keep verifying.
pub struct LocalSigner {
    secp: Secp256k1<secp256k1::All>,
    key: KeyMaterial,
    keyring: HashMap<String, PublicKey>,
}

impl LocalSigner {
    pub fn new(key: KeyMaterial) -> Self {
        let mut keyring = HashMap::new();
        keyring.insert(key.key_id.clone(), key.public_key);
        Self {
            secp: Secp256k1::new(),
            key,
            keyring,
        }
    }

    /// Signer with a freshly generated key (tests and throwaway environments).
    pub fn ephemeral() -> Self {
        Self::new(KeyMaterial::generate())
    }

    /// Trust an additional public key for verification; returns its key id.
    pub fn trust(&mut self, public_key: PublicKey) -> String {
        let key_id = derive_key_id(&public_key);
        self.keyring.insert(key_id.clone(), public_key);
        key_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public_key
    }

    pub fn create_signature(&self, message: &[u8]) -> Result<Signature> {
        let digest = message_digest(message)?;
        Ok(self.secp.sign_ecdsa(&digest, &self.key.secret_key))
    }

    pub fn verify_signature(
        &self,
        message: &[u8],
        signature: &str,
        public_key: &PublicKey,
    ) -> Result<bool> {
        let signature = match decode_signature(signature) {
            Some(signature) => signature,
            None => return Ok(false),
        };
        let digest = message_digest(message)?;

        match self.secp.verify_ecdsa(&digest, &signature, public_key) {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn key_id(&self) -> String {
        self.key.key_id.clone()
    }

    async fn sign(&self, message: &[u8]) -> Result<SignatureEnvelope> {
        let signature = self.create_signature(message)?;
        Ok(SignatureEnvelope {
            signature: hex::encode(signature.serialize_compact()),
            key_id: self.key.key_id.clone(),
        })
    }

    async fn verify(&self, message: &[u8], signature: &str, key_id: &str) -> Result<bool> {
        match self.keyring.get(key_id) {
            Some(public_key) => self.verify_signature(message, signature, public_key),
            // An unknown key cannot have produced a valid ledger signature.
            None => Ok(false),
        }
    }
}

fn message_digest(message: &[u8]) -> Result<Message> {
    let digest = Sha256::digest(message);
    Message::from_digest_slice(&digest)
        .map_err(|e| LedgerError::CryptoError(format!("Invalid message hash: {}", e)))
}

fn decode_signature(signature: &str) -> Option<Signature> {
    let bytes = hex::decode(signature).ok()?;
    Signature::from_compact(&bytes).ok()
}
