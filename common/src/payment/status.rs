// Payment actor status lattice
//
// Each side of a payment walks this lattice independently and only ever
// upwards, until it lands on one of the two terminal outcomes:
// ready_for_settlement on both sides, or abort on either side.

use serde::{Deserialize, Serialize};
use strum::Display;

/// Status of one actor of a payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    /// Initial state, nothing has been exchanged yet
    None,
    /// The counterparty must provide extended KYC data
    NeedsKycData,
    /// The receiver must attach a recipient signature
    NeedsRecipientSignature,
    /// KYC matching was inconclusive, additional data is required
    SoftMatch,
    /// This side considers the payment settleable
    ReadyForSettlement,
    /// Terminal failure state
    Abort,
}

impl Status {
    /// Height in the progress lattice. Abort is outside the lattice and is
    /// only reachable through the dedicated transition rules.
    pub fn height(&self) -> Option<u8> {
        match self {
            Status::None => Some(0),
            Status::NeedsKycData => Some(1),
            Status::NeedsRecipientSignature => Some(2),
            Status::SoftMatch => Some(3),
            Status::ReadyForSettlement => Some(4),
            Status::Abort => None,
        }
    }

    #[inline]
    pub fn is_abort(&self) -> bool {
        matches!(self, Status::Abort)
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self, Status::ReadyForSettlement)
    }
}

/// Status together with the abort justification carried alongside it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusObject {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_message: Option<String>,
}

impl StatusObject {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            abort_code: None,
            abort_message: None,
        }
    }

    pub fn abort(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: Status::Abort,
            abort_code: Some(code.into()),
            abort_message: Some(message.into()),
        }
    }

    pub fn as_status(&self) -> Status {
        self.status
    }
}

impl Default for StatusObject {
    fn default() -> Self {
        Self::new(Status::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heights_are_strictly_increasing() {
        let order = [
            Status::None,
            Status::NeedsKycData,
            Status::NeedsRecipientSignature,
            Status::SoftMatch,
            Status::ReadyForSettlement,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].height().unwrap() < pair[1].height().unwrap());
        }
        assert!(Status::Abort.height().is_none());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&Status::NeedsKycData).unwrap(),
            "\"needs_kyc_data\""
        );
        assert_eq!(Status::ReadyForSettlement.to_string(), "ready_for_settlement");
        let status: Status = serde_json::from_str("\"soft_match\"").unwrap();
        assert_eq!(status, Status::SoftMatch);
    }
}
