// Business policy surface consumed by the payment processor.
//
// The engine drives the protocol; everything requiring a compliance
// decision, account knowledge or user input goes through this interface.
// Any hook may force the payment into abort.

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

use offchain_common::command::PaymentCommand;
use offchain_common::crypto::OffChainAddress;
use offchain_common::payment::{KycData, PaymentObject, Status};

#[derive(Debug, Error)]
pub enum BusinessError {
    /// The business layer refuses to continue this payment. The processor
    /// drives our side to abort with the given code and message.
    #[error("force abort [{code}]: {message}")]
    ForceAbort { code: String, message: String },
    /// A provided artefact (typically the recipient signature) is invalid
    #[error("validation failure: {0}")]
    ValidationFailure(String),
    /// Unexpected failure inside the business layer
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BusinessError {
    pub fn force_abort(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ForceAbort {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Capabilities the processor needs from the VASP business layer.
///
/// `Context` carries whatever the implementation wants to thread from
/// `payment_pre_processing` into the per-payment hooks.
#[async_trait]
pub trait BusinessContext: Send + Sync + 'static {
    type Context: Send + Sync;

    /// Address of this VASP, the root of its persistent namespace
    fn get_my_address(&self) -> OffChainAddress;

    /// True when this VASP is the sender side of the payment
    fn is_sender(&self, payment: &PaymentObject, ctx: Option<&Self::Context>) -> bool {
        !self.is_recipient(payment, ctx)
    }

    /// True when this VASP is the receiver side of the payment
    fn is_recipient(&self, payment: &PaymentObject, ctx: Option<&Self::Context>) -> bool;

    /// Check the recipient signature attached to the payment
    fn validate_recipient_signature(&self, payment: &PaymentObject) -> Result<(), BusinessError>;

    /// Called once per committed command before any other processing,
    /// the returned context is handed to every later hook
    async fn payment_pre_processing(
        &self,
        other_address: &OffChainAddress,
        cid: &str,
        command: &PaymentCommand,
        payment: &PaymentObject,
    ) -> Result<Self::Context, BusinessError>;

    /// First hook of the payment progress pipeline
    async fn payment_initial_processing(
        &self,
        payment: &PaymentObject,
        ctx: Option<&Self::Context>,
    ) -> Result<(), BusinessError>;

    /// Verify the accounts named by the payment exist on our side
    async fn check_account_existence(
        &self,
        payment: &PaymentObject,
        ctx: Option<&Self::Context>,
    ) -> Result<(), BusinessError>;

    /// Next KYC level to request from the counterparty, `Status::None`
    /// when nothing further is needed
    async fn next_kyc_level_to_request(
        &self,
        payment: &PaymentObject,
        ctx: Option<&Self::Context>,
    ) -> Result<Status, BusinessError>;

    /// KYC artefacts we should attach to our own side right now
    async fn next_kyc_to_provide(
        &self,
        payment: &PaymentObject,
        ctx: Option<&Self::Context>,
    ) -> Result<HashSet<Status>, BusinessError>;

    async fn get_extended_kyc(
        &self,
        payment: &PaymentObject,
        ctx: Option<&Self::Context>,
    ) -> Result<KycData, BusinessError>;

    async fn get_additional_kyc(
        &self,
        payment: &PaymentObject,
        ctx: Option<&Self::Context>,
    ) -> Result<KycData, BusinessError>;

    /// Recipient signature over the payment, only valid on the receiver
    async fn get_recipient_signature(
        &self,
        payment: &PaymentObject,
        ctx: Option<&Self::Context>,
    ) -> Result<String, BusinessError>;

    /// True once we hold everything needed to settle the payment
    async fn ready_for_settlement(
        &self,
        payment: &PaymentObject,
        ctx: Option<&Self::Context>,
    ) -> Result<bool, BusinessError>;
}
