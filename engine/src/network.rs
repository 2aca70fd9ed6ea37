// Transport facing interface used by the processor to emit follow-up
// commands. The engine never implements the wire itself, it only hands a
// sequenced request to whatever transport the application wires in.

use async_trait::async_trait;
use thiserror::Error;

use offchain_common::api::CommandRequestObject;
use offchain_common::command::PaymentCommand;
use offchain_common::crypto::OffChainAddress;

#[derive(Debug, Error)]
pub enum NetworkError {
    /// The peer could not be reached, the caller may retry later
    #[error("transport error: {0}")]
    Transport(String),
    /// The command could not be sequenced on the local channel
    #[error("failed to sequence command: {0}")]
    Sequencing(String),
}

/// Outbound side of the protocol, consumed by the payment processor
#[async_trait]
pub trait CommandNetwork: Send + Sync {
    /// Sequence a locally created command on the channel with `other`
    async fn sequence_command(
        &self,
        other: &OffChainAddress,
        command: PaymentCommand,
    ) -> Result<CommandRequestObject, NetworkError>;

    /// Package and deliver a sequenced request to `other`
    async fn send_request(
        &self,
        other: &OffChainAddress,
        request: CommandRequestObject,
    ) -> Result<(), NetworkError>;
}
