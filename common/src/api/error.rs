use std::fmt;

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

/// Error codes carried on the wire inside failure responses.
///
/// The address related codes keep their historical wire spelling for
/// interoperability, the Rust names describe what they mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OffChainErrorCode {
    /// A read version was already consumed by another committed command
    Conflict,
    /// A read version is unknown to the responder
    MissingDependencies,
    /// The responder holds a stronger lock, retry the same request later
    Wait,
    /// The envelope signature did not verify
    InvalidSignature,
    /// The envelope payload was not a valid request or response
    ParsingError,
    PaymentWrongActor,
    PaymentWrongStructure,
    PaymentWrongStatus,
    PaymentChangedOtherActor,
    PaymentWrongRecipientSignature,
    #[serde(rename = "payment_invalid_libra_address")]
    #[strum(serialize = "payment_invalid_libra_address")]
    PaymentInvalidAddress,
    #[serde(rename = "payment_invalid_libra_subaddress")]
    #[strum(serialize = "payment_invalid_libra_subaddress")]
    PaymentInvalidSubaddress,
    /// Unexpected failure inside the VASP business logic
    PaymentVaspError,
}

/// Error payload of a failure response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffChainError {
    pub code: OffChainErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OffChainError {
    pub fn new(code: OffChainErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn from_code(code: OffChainErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }
}

impl fmt::Display for OffChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.code, message),
            None => write!(f, "{}", self.code),
        }
    }
}

/// Rejection raised by the payment layer while checking an incoming
/// command. It is turned into a failure response carrying its code.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct PaymentLogicError {
    pub code: OffChainErrorCode,
    pub message: String,
}

impl PaymentLogicError {
    pub fn new(code: OffChainErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<PaymentLogicError> for OffChainError {
    fn from(error: PaymentLogicError) -> Self {
        OffChainError::new(error.code, error.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_spellings() {
        assert_eq!(
            serde_json::to_string(&OffChainErrorCode::MissingDependencies).unwrap(),
            "\"missing_dependencies\""
        );
        assert_eq!(
            serde_json::to_string(&OffChainErrorCode::PaymentInvalidAddress).unwrap(),
            "\"payment_invalid_libra_address\""
        );
        assert_eq!(
            OffChainErrorCode::PaymentInvalidSubaddress.to_string(),
            "payment_invalid_libra_subaddress"
        );
        let code: OffChainErrorCode = serde_json::from_str("\"wait\"").unwrap();
        assert_eq!(code, OffChainErrorCode::Wait);
    }
}
