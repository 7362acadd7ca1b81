//! Remote HSM/KMS signer
//!
//! Talks to a signing service over HTTP:
//! `POST {base}/v1/sign {key_id?, message}` -> `{signature, key_id}` and
//! `POST {base}/v1/verify {key_id, message, signature}` -> `{valid}`.
//! Messages travel hex-encoded. A 400 or 422 from `/v1/verify` is a
//! verdict of "invalid"; other 4xx mean the request itself was refused.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{SignatureEnvelope, Signer};
use crate::error::{LedgerError, Result};

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    key_id: Option<&'a str>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
    key_id: String,
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    key_id: &'a str,
    message: String,
    signature: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    valid: bool,
}

pub struct RemoteSigner {
    base_url: String,
    key_id: Option<String>,
    http_client: Client,
}

impl RemoteSigner {
    pub fn new(base_url: String, key_id: Option<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            key_id,
            http_client,
        })
    }

    async fn send<Req: Serialize>(&self, path: &str, body: &Req) -> Result<(String, Response)> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| LedgerError::SignerUnavailable(format!("{} unreachable: {}", url, e)))?;
        Ok((url, response))
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        let (url, response) = self.send(path, body).await?;
        read_json(&url, response).await
    }
}

async fn read_json<Resp: for<'de> Deserialize<'de>>(url: &str, response: Response) -> Result<Resp> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }

    response.json::<Resp>().await.map_err(|e| {
        LedgerError::SignerRejected(format!("Unexpected response from {}: {}", url, e))
    })
}

/// Statuses with which `/v1/verify` answers "this signature is not valid
/// for that key" rather than "could not verify".
fn means_invalid_signature(status: StatusCode) -> bool {
    status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY
}

fn classify_status(status: StatusCode, body: &str) -> LedgerError {
    let message = format!("signer returned {}: {}", status, body);
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        LedgerError::SignerUnavailable(message)
    } else {
        LedgerError::SignerRejected(message)
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    fn key_id(&self) -> String {
        self.key_id.clone().unwrap_or_else(|| "remote:default".to_string())
    }

    async fn sign(&self, message: &[u8]) -> Result<SignatureEnvelope> {
        let request = SignRequest {
            key_id: self.key_id.as_deref(),
            message: hex::encode(message),
        };
        let response: SignResponse = self.post("/v1/sign", &request).await?;
        let envelope = SignatureEnvelope {
            signature: response.signature,
            key_id: response.key_id,
        };
        envelope.validate()?;
        debug!("Remote signer produced signature with key {}", envelope.key_id);
        Ok(envelope)
    }

    async fn verify(&self, message: &[u8], signature: &str, key_id: &str) -> Result<bool> {
        let request = VerifyRequest {
            key_id,
            message: hex::encode(message),
            signature,
        };
        let (url, response) = self.send("/v1/verify", &request).await?;
        if means_invalid_signature(response.status()) {
            debug!(
                "Remote signer answered {} for key {}; treating signature as invalid",
                response.status(),
                key_id
            );
            return Ok(false);
        }
        let response: VerifyResponse = read_json(&url, response).await?;
        Ok(response.valid)
    }
}
