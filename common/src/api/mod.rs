// Wire messages exchanged between two channels, always wrapped in a signed
// envelope by the transport layer. The request object doubles as the stored
// record of a committed command: on the wire `status` and `response` are
// absent, in the command log they carry the final outcome.

mod error;

pub use error::*;

use serde::{Deserialize, Serialize};

use crate::command::PaymentCommand;
use crate::crypto::random::unique_id;

/// Outcome of a command, as reported in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    Failure,
}

/// A command proposal sent to the peer, identified by a fresh `cid`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequestObject {
    pub cid: String,
    pub command: PaymentCommand,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CommandStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<CommandResponseObject>,
}

impl CommandRequestObject {
    pub fn new(command: PaymentCommand) -> Self {
        Self {
            cid: unique_id(),
            command,
            status: None,
            response: None,
        }
    }

    /// The record stored in the command log once an outcome is known
    pub fn into_record(mut self, response: CommandResponseObject) -> Self {
        self.status = Some(response.status);
        self.response = Some(response);
        self
    }

    /// Strip the outcome fields, giving back the wire form
    pub fn as_wire(&self) -> Self {
        Self {
            cid: self.cid.clone(),
            command: self.command.clone(),
            status: None,
            response: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(CommandStatus::Success))
    }
}

/// Response to a command request, echoing its `cid`. Responses produced
/// before a cid could be parsed carry none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponseObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OffChainError>,
}

impl CommandResponseObject {
    pub fn success(cid: impl Into<String>) -> Self {
        Self {
            cid: Some(cid.into()),
            status: CommandStatus::Success,
            error: None,
        }
    }

    pub fn failure(cid: Option<String>, error: OffChainError) -> Self {
        Self {
            cid,
            status: CommandStatus::Failure,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, CommandStatus::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, CommandStatus::Failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ONCHAIN_ADDRESS_SIZE, SUBADDRESS_SIZE};
    use crate::crypto::random::secure_random_bytes;
    use crate::crypto::OffChainAddress;
    use crate::payment::{PaymentActor, PaymentObject};

    fn account() -> OffChainAddress {
        OffChainAddress::new(
            secure_random_bytes::<ONCHAIN_ADDRESS_SIZE>(),
            Some(secure_random_bytes::<SUBADDRESS_SIZE>()),
        )
    }

    fn sample_command() -> PaymentCommand {
        let origin = OffChainAddress::new(secure_random_bytes::<ONCHAIN_ADDRESS_SIZE>(), None);
        let payment = PaymentObject::new(
            PaymentActor::new(&account()),
            PaymentActor::new(&account()),
            PaymentObject::make_reference_id(&origin, "abc"),
        );
        PaymentCommand::new(payment, origin)
    }

    #[test]
    fn test_request_round_trip() {
        let request = CommandRequestObject::new(sample_command());
        let data = serde_json::to_string(&request).unwrap();
        assert!(!data.contains("\"status\""));
        let back: CommandRequestObject = serde_json::from_str(&data).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_record_round_trip() {
        let request = CommandRequestObject::new(sample_command());
        let response = CommandResponseObject::failure(
            Some(request.cid.clone()),
            OffChainError::from_code(OffChainErrorCode::Conflict),
        );
        let record = request.into_record(response.clone());
        assert!(!record.is_success());

        let data = serde_json::to_string(&record).unwrap();
        let back: CommandRequestObject = serde_json::from_str(&data).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.response, Some(response));
    }

    #[test]
    fn test_response_round_trip() {
        let response = CommandResponseObject::success("abcd");
        let data = serde_json::to_string(&response).unwrap();
        let back: CommandResponseObject = serde_json::from_str(&data).unwrap();
        assert_eq!(back, response);
        assert!(back.is_success());
    }
}
