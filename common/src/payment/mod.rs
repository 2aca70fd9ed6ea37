mod status;

pub use status::*;

use serde::{Deserialize, Serialize};

use crate::config::REFERENCE_ID_SEPARATOR;
use crate::crypto::{random::unique_id, OffChainAddress};

/// Opaque KYC payload exchanged between the two parties. The engine never
/// interprets it, only the business layer does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KycData(String);

impl KycData {
    pub fn new(blob: impl Into<String>) -> Self {
        Self(blob.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One side of a payment: the account taking part, the KYC data provided so
/// far and the current status of that side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentActor {
    /// Encoded address including the subaddress of the account
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kyc_data: Option<KycData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_kyc_data: Option<KycData>,
    pub status: StatusObject,
}

impl PaymentActor {
    pub fn new(address: &OffChainAddress) -> Self {
        Self {
            address: address.as_str(),
            kyc_data: None,
            additional_kyc_data: None,
            status: StatusObject::default(),
        }
    }

    pub fn add_kyc_data(&mut self, kyc: KycData) {
        self.kyc_data = Some(kyc);
    }

    pub fn add_additional_kyc_data(&mut self, kyc: KycData) {
        self.additional_kyc_data = Some(kyc);
    }

    pub fn change_status(&mut self, status: StatusObject) {
        self.status = status;
    }
}

/// Side of a payment, from the point of view of one party
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentRole {
    Sender,
    Receiver,
}

impl PaymentRole {
    pub fn other(&self) -> Self {
        match self {
            PaymentRole::Sender => PaymentRole::Receiver,
            PaymentRole::Receiver => PaymentRole::Sender,
        }
    }

    pub fn is_sender(&self) -> bool {
        matches!(self, PaymentRole::Sender)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentRole::Sender => "sender",
            PaymentRole::Receiver => "receiver",
        }
    }
}

/// An immutable snapshot of a payment, shared between the two parties.
///
/// Every mutation produces a fresh snapshot with a new random `version`,
/// linked to its ancestor through `previous_version`. The `reference_id`
/// names the logical payment and never changes across versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentObject {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    pub sender: PaymentActor,
    pub receiver: PaymentActor,
    pub reference_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_payment_reference_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_signature: Option<String>,
}

impl PaymentObject {
    pub fn new(sender: PaymentActor, receiver: PaymentActor, reference_id: impl Into<String>) -> Self {
        Self {
            version: unique_id(),
            previous_version: None,
            sender,
            receiver,
            reference_id: reference_id.into(),
            original_payment_reference_id: None,
            description: None,
            recipient_signature: None,
        }
    }

    /// Build the reference id of a brand new payment originated by `party`
    pub fn make_reference_id(party: &OffChainAddress, suffix: &str) -> String {
        format!(
            "{}{}{}",
            party.onchain_str(),
            REFERENCE_ID_SEPARATOR,
            suffix
        )
    }

    /// A fresh version of this payment, carrying the same content and
    /// linked to this snapshot through `previous_version`
    pub fn new_version(&self) -> Self {
        self.new_version_with(unique_id())
    }

    /// Same as `new_version` but reusing an already minted version id, used
    /// to restart processing from a clean snapshot without changing the
    /// version the emitted command will write.
    pub fn new_version_with(&self, version: String) -> Self {
        let mut payment = self.clone();
        payment.previous_version = Some(self.version.clone());
        payment.version = version;
        payment
    }

    pub fn actor(&self, role: PaymentRole) -> &PaymentActor {
        match role {
            PaymentRole::Sender => &self.sender,
            PaymentRole::Receiver => &self.receiver,
        }
    }

    pub fn actor_mut(&mut self, role: PaymentRole) -> &mut PaymentActor {
        match role {
            PaymentRole::Sender => &mut self.sender,
            PaymentRole::Receiver => &mut self.receiver,
        }
    }

    pub fn status_of(&self, role: PaymentRole) -> Status {
        self.actor(role).status.as_status()
    }

    pub fn add_recipient_signature(&mut self, signature: impl Into<String>) {
        self.recipient_signature = Some(signature.into());
    }

    /// True when this snapshot carries a semantic change compared to
    /// `other`, ignoring the version ancestry fields
    pub fn differs_from(&self, other: &Self) -> bool {
        self.sender != other.sender
            || self.receiver != other.receiver
            || self.reference_id != other.reference_id
            || self.original_payment_reference_id != other.original_payment_reference_id
            || self.description != other.description
            || self.recipient_signature != other.recipient_signature
    }

    /// A payment is final once either side aborted or both sides declared
    /// themselves ready for settlement
    pub fn is_final(&self) -> bool {
        let sender = self.status_of(PaymentRole::Sender);
        let receiver = self.status_of(PaymentRole::Receiver);
        sender.is_abort() || receiver.is_abort() || (sender.is_ready() && receiver.is_ready())
    }
}
