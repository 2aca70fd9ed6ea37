// Shared helpers for the protocol level tests: channels wired to a
// permissive processor so the channel machinery can be driven with
// hand-built commands.
#![allow(dead_code)]

use std::sync::Arc;

use offchain_common::api::{OffChainError, OffChainErrorCode, PaymentLogicError};
use offchain_common::command::PaymentCommand;
use offchain_common::config::{ONCHAIN_ADDRESS_SIZE, SUBADDRESS_SIZE};
use offchain_common::crypto::random::secure_random_bytes;
use offchain_common::crypto::OffChainAddress;
use offchain_common::payment::{PaymentActor, PaymentObject};

use offchain_engine::channel::VaspPairChannel;
use offchain_engine::processor::{CommandProcessor, ProcessorError};
use offchain_engine::signer::HmacEnvelopeSigner;
use offchain_engine::storage::{Database, MemoryDatabase};
use offchain_engine::store::PaymentStore;

pub const CHANNEL_SECRET: &[u8] = b"two party shared secret";

/// Processor that accepts every command and ignores notifications
pub struct NullProcessor;

impl CommandProcessor for NullProcessor {
    fn check_command(
        &self,
        _my_address: &OffChainAddress,
        _other_address: &OffChainAddress,
        _command: &PaymentCommand,
    ) -> Result<(), ProcessorError> {
        Ok(())
    }

    fn process_command(
        self: Arc<Self>,
        _other_address: OffChainAddress,
        _command: PaymentCommand,
        _cid: String,
        _success: bool,
        _error: Option<OffChainError>,
    ) {
    }
}

/// Processor that rejects commands whose payment description says so,
/// used to exercise command level failures in random runs
pub struct RejectingProcessor;

impl CommandProcessor for RejectingProcessor {
    fn check_command(
        &self,
        _my_address: &OffChainAddress,
        _other_address: &OffChainAddress,
        command: &PaymentCommand,
    ) -> Result<(), ProcessorError> {
        if command.payment.description.as_deref() == Some("invalid") {
            return Err(PaymentLogicError::new(
                OffChainErrorCode::PaymentWrongStatus,
                "command flagged as invalid",
            )
            .into());
        }
        Ok(())
    }

    fn process_command(
        self: Arc<Self>,
        _other_address: OffChainAddress,
        _command: PaymentCommand,
        _cid: String,
        _success: bool,
        _error: Option<OffChainError>,
    ) {
    }
}

/// On-chain only address with a fixed body and a chosen last byte
pub fn party(last: u8) -> OffChainAddress {
    let mut bytes = [0x11u8; ONCHAIN_ADDRESS_SIZE];
    bytes[ONCHAIN_ADDRESS_SIZE - 1] = last;
    OffChainAddress::new(bytes, None)
}

/// Random account address with a subaddress
pub fn account() -> OffChainAddress {
    OffChainAddress::new(
        secure_random_bytes::<ONCHAIN_ADDRESS_SIZE>(),
        Some(secure_random_bytes::<SUBADDRESS_SIZE>()),
    )
}

/// A random account below the given party
pub fn account_of(party: &OffChainAddress) -> OffChainAddress {
    let subaddress = secure_random_bytes::<SUBADDRESS_SIZE>();
    OffChainAddress::from_encoded_str(&format!(
        "{}{}",
        party.onchain_str(),
        hex::encode(subaddress)
    ))
    .expect("valid account address")
}

/// A command writing the object version `item` and reading `deps`, the
/// protocol level analogue of a payment update
pub fn sample_command(item: &str, deps: &[&str], origin: &OffChainAddress) -> PaymentCommand {
    let reference_id = PaymentObject::make_reference_id(origin, item);
    let mut payment = PaymentObject::new(
        PaymentActor::new(&account()),
        PaymentActor::new(&account()),
        reference_id.clone(),
    );
    payment.version = item.to_owned();
    let reads = deps
        .iter()
        .map(|dep| (reference_id.clone(), (*dep).to_owned()))
        .collect();
    let writes = vec![(reference_id, item.to_owned())];
    PaymentCommand::from_parts(payment, reads, writes, origin.clone())
}

pub fn make_channel(
    me: OffChainAddress,
    other: OffChainAddress,
    processor: Arc<dyn CommandProcessor>,
) -> Arc<VaspPairChannel> {
    let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
    let store = Arc::new(PaymentStore::new(Arc::clone(&db), &me));
    Arc::new(
        VaspPairChannel::new(
            me,
            other,
            processor,
            Arc::new(HmacEnvelopeSigner::new(CHANNEL_SECRET.to_vec())),
            store,
            db,
        )
        .expect("channel construction"),
    )
}

/// A connected (server, client) channel pair with independent storage
pub fn two_channels() -> (Arc<VaspPairChannel>, Arc<VaspPairChannel>) {
    two_channels_with(|| Arc::new(NullProcessor))
}

pub fn two_channels_with(
    processor: impl Fn() -> Arc<dyn CommandProcessor>,
) -> (Arc<VaspPairChannel>, Arc<VaspPairChannel>) {
    // last bits differ, so the larger address takes the server role
    let a = party(0x02);
    let b = party(0x03);
    let server = make_channel(b.clone(), a.clone(), processor());
    let client = make_channel(a, b, processor());
    assert!(server.is_server());
    assert!(client.is_client());
    (server, client)
}
