use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignatureClientError {
    #[error("signature provider request failed: {0}")]
    Http(String),
    #[error("signature provider response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedEnvelope {
    pub envelope_id: String,
    pub signing_url: Option<String>,
}

#[async_trait]
pub trait SignatureClient: Send + Sync {
    /// Creates an envelope around an already-rendered PDF for one signer.
    async fn create_envelope(
        &self,
        document_name: &str,
        pdf_url: &str,
        signer_name: &str,
        signer_email: &str,
    ) -> Result<CreatedEnvelope, SignatureClientError>;

    async fn signing_url(
        &self,
        envelope_id: &str,
        signer_email: &str,
        return_url: &str,
    ) -> Result<String, SignatureClientError>;

    /// Completion certificate for a finished envelope.
    async fn download_certificate(
        &self,
        envelope_id: &str,
    ) -> Result<Vec<u8>, SignatureClientError>;

    async fn download_signed_document(
        &self,
        envelope_id: &str,
    ) -> Result<Vec<u8>, SignatureClientError>;
}

pub struct HttpSignatureClient {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpSignatureClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        timeout_secs: u64,
    ) -> Result<Self, SignatureClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|error| SignatureClientError::Http(error.to_string()))?;

        Ok(Self { client, base_url: base_url.into(), api_key })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, SignatureClientError> {
        let response = self
            .client
            .get(self.endpoint(path))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(|error| SignatureClientError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(SignatureClientError::Http(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|error| SignatureClientError::Http(error.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct EnvelopeResponse {
    envelope_id: String,
    #[serde(default)]
    signing_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SigningUrlResponse {
    url: String,
}

#[async_trait]
impl SignatureClient for HttpSignatureClient {
    async fn create_envelope(
        &self,
        document_name: &str,
        pdf_url: &str,
        signer_name: &str,
        signer_email: &str,
    ) -> Result<CreatedEnvelope, SignatureClientError> {
        let response = self
            .client
            .post(self.endpoint("v1/envelopes"))
            .bearer_auth(self.api_key.expose_secret())
            .json(&serde_json::json!({
                "document_name": document_name,
                "document_url": pdf_url,
                "signer": { "name": signer_name, "email": signer_email },
            }))
            .send()
            .await
            .map_err(|error| SignatureClientError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(SignatureClientError::Http(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let envelope: EnvelopeResponse = response
            .json()
            .await
            .map_err(|error| SignatureClientError::Decode(error.to_string()))?;

        Ok(CreatedEnvelope {
            envelope_id: envelope.envelope_id,
            signing_url: envelope.signing_url,
        })
    }

    async fn signing_url(
        &self,
        envelope_id: &str,
        signer_email: &str,
        return_url: &str,
    ) -> Result<String, SignatureClientError> {
        let response = self
            .client
            .post(self.endpoint(&format!("v1/envelopes/{envelope_id}/signing-url")))
            .bearer_auth(self.api_key.expose_secret())
            .json(&serde_json::json!({
                "signer_email": signer_email,
                "return_url": return_url,
            }))
            .send()
            .await
            .map_err(|error| SignatureClientError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(SignatureClientError::Http(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let payload: SigningUrlResponse = response
            .json()
            .await
            .map_err(|error| SignatureClientError::Decode(error.to_string()))?;

        Ok(payload.url)
    }

    async fn download_certificate(
        &self,
        envelope_id: &str,
    ) -> Result<Vec<u8>, SignatureClientError> {
        self.download(&format!("v1/envelopes/{envelope_id}/certificate")).await
    }

    async fn download_signed_document(
        &self,
        envelope_id: &str,
    ) -> Result<Vec<u8>, SignatureClientError> {
        self.download(&format!("v1/envelopes/{envelope_id}/document")).await
    }
}

/// Test double recording calls and serving canned artifacts.
#[derive(Default)]
pub struct RecordingSignatureClient {
    pub created: Mutex<Vec<String>>,
    pub certificate: Vec<u8>,
    pub fail_downloads: bool,
}

impl RecordingSignatureClient {
    pub fn with_certificate(certificate: Vec<u8>) -> Self {
        Self { certificate, ..Self::default() }
    }
}

#[async_trait]
impl SignatureClient for RecordingSignatureClient {
    async fn create_envelope(
        &self,
        document_name: &str,
        _pdf_url: &str,
        _signer_name: &str,
        _signer_email: &str,
    ) -> Result<CreatedEnvelope, SignatureClientError> {
        let mut created = self.created.lock().unwrap();
        let envelope_id = format!("env-{}", created.len() + 1);
        created.push(document_name.to_string());
        Ok(CreatedEnvelope {
            envelope_id: envelope_id.clone(),
            signing_url: Some(format!("https://sign.example.com/{envelope_id}")),
        })
    }

    async fn signing_url(
        &self,
        envelope_id: &str,
        _signer_email: &str,
        _return_url: &str,
    ) -> Result<String, SignatureClientError> {
        Ok(format!("https://sign.example.com/{envelope_id}"))
    }

    async fn download_certificate(
        &self,
        _envelope_id: &str,
    ) -> Result<Vec<u8>, SignatureClientError> {
        if self.fail_downloads {
            return Err(SignatureClientError::Http("connection timed out".to_string()));
        }
        Ok(self.certificate.clone())
    }

    async fn download_signed_document(
        &self,
        _envelope_id: &str,
    ) -> Result<Vec<u8>, SignatureClientError> {
        if self.fail_downloads {
            return Err(SignatureClientError::Http("connection timed out".to_string()));
        }
        Ok(self.certificate.clone())
    }
}
