//! Signing Boundary
//!
//! Record hashes and batch roots are signed through a `Signer`, which is
//! either a key held in-process (`LocalSigner`) or a remote HSM/KMS service
//! (`RemoteSigner`).

pub mod keys;
pub mod remote;
pub mod signatures;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LedgerError, Result};
use crate::retry::RetryPolicy;

pub use keys::{derive_key_id, KeyMaterial};
pub use remote::RemoteSigner;
pub use signatures::LocalSigner;

/// A signature together with the identity of the key that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    pub signature: String,
    pub key_id: String,
}

impl SignatureEnvelope {
    /// An envelope must carry a non-empty hex signature and a key id before
    /// anything is written under it.
    pub fn validate(&self) -> Result<()> {
        if self.key_id.trim().is_empty() {
            return Err(LedgerError::SignerRejected(
                "Signer returned an empty key id".to_string(),
            ));
        }
        if self.signature.is_empty() {
            return Err(LedgerError::SignerRejected(format!(
                "Signer returned an empty signature for key {}",
                self.key_id
            )));
        }
        if hex::decode(&self.signature).is_err() {
            return Err(LedgerError::SignerRejected(format!(
                "Signer returned a non-hex signature for key {}",
                self.key_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
pub trait Signer: Send + Sync {
    /// Key id new signatures are produced with.
    fn key_id(&self) -> String;

    async fn sign(&self, message: &[u8]) -> Result<SignatureEnvelope>;

    /// Returns `Ok(false)` for a well-formed request whose signature does not
    /// check out; errors are reserved for "could not verify".
    async fn verify(&self, message: &[u8], signature: &str, key_id: &str) -> Result<bool>;
}

/// Sign with per-attempt timeout and bounded backoff on retryable failures.
pub async fn sign_with_retry(
    signer: &dyn Signer,
    message: &[u8],
    policy: &RetryPolicy,
) -> Result<SignatureEnvelope> {
    let mut attempt = 1;
    loop {
        let outcome = match tokio::time::timeout(policy.attempt_timeout, signer.sign(message)).await
        {
            Ok(result) => result,
            Err(_) => Err(LedgerError::SignerUnavailable(format!(
                "Signing timed out after {:?}",
                policy.attempt_timeout
            ))),
        };

        match outcome {
            Ok(envelope) => {
                envelope.validate()?;
                return Ok(envelope);
            }
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "Signing attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, policy.max_attempts, err, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Verify with a bounded per-call timeout; a timeout means "could not verify".
pub async fn verify_with_timeout(
    signer: &dyn Signer,
    message: &[u8],
    signature: &str,
    key_id: &str,
    policy: &RetryPolicy,
) -> Result<bool> {
    match tokio::time::timeout(policy.attempt_timeout, signer.verify(message, signature, key_id))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(LedgerError::SignerUnavailable(format!(
            "Verification timed out after {:?}",
            policy.attempt_timeout
        ))),
    }
}
