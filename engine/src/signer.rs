// Signed envelope layer around wire messages.
//
// The actual signing primitive is external to the engine: the channel only
// needs to turn a payload into an envelope and back. Envelopes are compact
// `<payload>.<hex signature>` strings, the signature never contains a dot
// so the split is unambiguous.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("envelope is not in payload.signature form")]
    MalformedEnvelope,
    #[error("envelope signature does not verify")]
    InvalidSignature,
    #[error("signing failed: {0}")]
    Signing(String),
}

/// External signing primitive for protocol envelopes
#[async_trait]
pub trait EnvelopeSigner: Send + Sync {
    /// Wrap a payload into a signed envelope
    async fn sign_message(&self, payload: &str) -> Result<String, SignatureError>;

    /// Verify an envelope and return its payload
    async fn verify_message(&self, envelope: &str) -> Result<String, SignatureError>;
}

/// HMAC-SHA256 envelope signer over a secret shared by the two endpoints
/// of a channel. Signatures are lowercase hex.
pub struct HmacEnvelopeSigner {
    secret: Vec<u8>,
}

impl HmacEnvelopeSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn signature(&self, payload: &str) -> Result<String, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| SignatureError::Signing(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl EnvelopeSigner for HmacEnvelopeSigner {
    async fn sign_message(&self, payload: &str) -> Result<String, SignatureError> {
        Ok(format!("{}.{}", payload, self.signature(payload)?))
    }

    async fn verify_message(&self, envelope: &str) -> Result<String, SignatureError> {
        let (payload, signature) = envelope
            .rsplit_once('.')
            .ok_or(SignatureError::MalformedEnvelope)?;
        let expected = self.signature(payload)?;
        if signature != expected {
            return Err(SignatureError::InvalidSignature);
        }
        Ok(payload.to_owned())
    }
}
