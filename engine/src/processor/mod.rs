// The payment logic on top of the channel protocol.
//
// The channel calls `check_command` synchronously while deciding a request
// and `process_command` after every durable outcome. Processing runs in
// its own task: it updates outcome waiters and, when the committed command
// came from the peer, produces our next command in response.

mod business;

pub use business::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use futures::future::join_all;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use offchain_common::api::{OffChainError, OffChainErrorCode, PaymentLogicError};
use offchain_common::command::PaymentCommand;
use offchain_common::config::REFERENCE_ID_SEPARATOR;
use offchain_common::crypto::random::unique_id;
use offchain_common::crypto::OffChainAddress;
use offchain_common::payment::{PaymentObject, PaymentRole, Status, StatusObject};

use crate::network::{CommandNetwork, NetworkError};
use crate::storage::StorageError;
use crate::store::PaymentStore;

/// Hooks the channel needs from the layer above it
pub trait CommandProcessor: Send + Sync {
    /// Fast synchronous validation of an incoming command, called while
    /// the channel decides the outcome of a request
    fn check_command(
        &self,
        my_address: &OffChainAddress,
        other_address: &OffChainAddress,
        command: &PaymentCommand,
    ) -> Result<(), ProcessorError>;

    /// Notification of a durable outcome, success or failure. Must not
    /// block: heavy work happens in a spawned task.
    fn process_command(
        self: Arc<Self>,
        other_address: OffChainAddress,
        command: PaymentCommand,
        cid: String,
        success: bool,
        error: Option<OffChainError>,
    );
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The incoming command violates the payment rules, reported to the
    /// peer as a failure response carrying the code
    #[error(transparent)]
    Logic(#[from] PaymentLogicError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Business(#[from] BusinessError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("no network assigned to the processor")]
    NetworkNotSet,
    #[error("a network was already assigned to the processor")]
    NetworkAlreadySet,
    #[error(
        "invalid status transition for {reference_id}: ({sender}, {receiver}) -> {new_status} as {role}"
    )]
    InvalidStatusTransition {
        reference_id: String,
        sender: Status,
        receiver: Status,
        new_status: Status,
        role: &'static str,
    },
}

/// Terminal result surfaced to `wait_for_payment_outcome` callers when the
/// payment cannot reach a final state through this command
#[derive(Debug, Clone, Error)]
pub enum PaymentOutcomeError {
    #[error("peer rejected the command: {0}")]
    Remote(OffChainError),
    #[error("no progress was possible, retry with fresh business input")]
    NoProgress,
    #[error("the processor went away before an outcome was reached")]
    Closed,
}

type OutcomeSender = oneshot::Sender<Result<PaymentObject, PaymentOutcomeError>>;

/// Checks whether an actor may move its side of `payment` to `new_self`.
///
/// Progress must be monotone in the status lattice, an abort of the peer
/// forces an abort, abort is absorbing, and a side that declared itself
/// ready for settlement is frozen unless the peer aborts.
pub fn can_change_status(payment: &PaymentObject, new_self: Status, actor_is_sender: bool) -> bool {
    let (old_self, other) = if actor_is_sender {
        (
            payment.status_of(PaymentRole::Sender),
            payment.status_of(PaymentRole::Receiver),
        )
    } else {
        (
            payment.status_of(PaymentRole::Receiver),
            payment.status_of(PaymentRole::Sender),
        )
    };

    let mut valid = true;

    // if the other side aborts, self shall abort
    if other.is_abort() {
        valid &= new_self.is_abort();
    }
    // once self aborted it shall not change status
    if old_self.is_abort() {
        valid &= new_self == old_self;
    }
    // frozen once both sides are ready for settlement
    if old_self.is_ready() && other.is_ready() {
        valid &= new_self == old_self;
    }
    // a ready side only moves again when the peer aborts
    if old_self.is_ready() && !other.is_abort() {
        valid &= new_self == old_self;
    }
    // respect the ordering of statuses
    if let (Some(new_height), Some(old_height)) = (new_self.height(), old_self.height()) {
        valid &= new_height >= old_height;
    }
    valid
}

/// A new payment is well formed when the side that did not create it still
/// has everything to say, i.e. starts from status none
pub fn good_initial_status(payment: &PaymentObject, creator_is_sender: bool) -> bool {
    if creator_is_sender {
        payment.status_of(PaymentRole::Receiver) == Status::None
    } else {
        payment.status_of(PaymentRole::Sender) == Status::None
    }
}

enum Flow {
    /// The payment is already settled on our side, nothing to emit
    Settled(PaymentObject),
    Progress {
        new_payment: PaymentObject,
        current: Status,
        abort_code: Option<String>,
        abort_message: Option<String>,
    },
}

pub struct PaymentProcessor<B: BusinessContext> {
    business: Arc<B>,
    store: Arc<PaymentStore>,
    net: OnceLock<Arc<dyn CommandNetwork>>,
    // reference_id -> waiters resolved at the first final state
    outcome_futures: Mutex<HashMap<String, Vec<OutcomeSender>>>,
    // processing tasks spawned from process_command, drained by tests
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: BusinessContext> PaymentProcessor<B> {
    pub fn new(business: Arc<B>, store: Arc<PaymentStore>) -> Self {
        Self {
            business,
            store,
            net: OnceLock::new(),
            outcome_futures: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Assign the concrete network used to emit follow-up commands
    pub fn set_network(&self, net: Arc<dyn CommandNetwork>) -> Result<(), ProcessorError> {
        self.net
            .set(net)
            .map_err(|_| ProcessorError::NetworkAlreadySet)
    }

    pub fn business(&self) -> &Arc<B> {
        &self.business
    }

    pub fn store(&self) -> &Arc<PaymentStore> {
        &self.store
    }

    // ----- payment lookups -----

    pub fn get_latest_payment_by_ref_id(
        &self,
        reference_id: &str,
    ) -> Result<Option<PaymentObject>, StorageError> {
        self.store.latest_payment(reference_id)
    }

    /// All committed versions of a payment, newest first
    pub fn get_payment_history_by_ref_id(
        &self,
        reference_id: &str,
    ) -> Result<Vec<PaymentObject>, StorageError> {
        self.store.payment_history(reference_id)
    }

    // ----- outcome notification -----

    /// Wait until the payment reaches a final state: ready for settlement
    /// on both sides or abort on either. Waiters are in-memory only and do
    /// not survive a restart.
    pub async fn wait_for_payment_outcome(
        &self,
        reference_id: &str,
    ) -> Result<PaymentObject, PaymentOutcomeError> {
        let receiver = {
            let Some(mut futures) = self.outcomes() else {
                return Err(PaymentOutcomeError::Closed);
            };
            let (sender, receiver) = oneshot::channel();
            futures.entry(reference_id.to_owned()).or_default().push(sender);
            receiver
        };

        // The payment may already be settled
        if let Ok(Some(payment)) = self.store.latest_payment(reference_id) {
            self.set_payment_outcome(&payment);
        }

        receiver.await.map_err(|_| PaymentOutcomeError::Closed)?
    }

    /// Resolve waiters when `payment` is in a final state
    pub fn set_payment_outcome(&self, payment: &PaymentObject) {
        if !payment.is_final() {
            return;
        }
        let Some(mut futures) = self.outcomes() else {
            return;
        };
        if let Some(senders) = futures.remove(&payment.reference_id) {
            for sender in senders {
                let _ = sender.send(Ok(payment.clone()));
            }
        }
    }

    /// Resolve waiters with a failure
    pub fn set_payment_outcome_exception(&self, reference_id: &str, error: PaymentOutcomeError) {
        let Some(mut futures) = self.outcomes() else {
            return;
        };
        if let Some(senders) = futures.remove(reference_id) {
            for sender in senders {
                let _ = sender.send(Err(error.clone()));
            }
        }
    }

    fn outcomes(&self) -> Option<MutexGuard<'_, HashMap<String, Vec<OutcomeSender>>>> {
        match self.outcome_futures.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                error!("outcome future map lock poisoned");
                None
            }
        }
    }

    /// Await every processing task spawned so far, including the ones
    /// spawned while waiting. Used by tests to reach quiescence.
    pub async fn wait_for_tasks(&self) {
        loop {
            let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
                Ok(mut guard) => guard.drain(..).collect(),
                Err(_) => return,
            };
            if tasks.is_empty() {
                return;
            }
            join_all(tasks).await;
        }
    }

    // ----- command validation (sync, called by the channel) -----

    fn check_command_impl(
        &self,
        my_address: &OffChainAddress,
        other_address: &OffChainAddress,
        command: &PaymentCommand,
    ) -> Result<(), ProcessorError> {
        let payment = &command.payment;

        if command.writes_version_map.len() != 1
            || command.new_object_versions().any(|v| v != payment.version)
            || command.writes_version_map[0].0 != payment.reference_id
        {
            return Err(PaymentLogicError::new(
                OffChainErrorCode::PaymentWrongStructure,
                "write map does not match the payment snapshot",
            )
            .into());
        }

        // The two payment actors must be exactly the channel parties
        let sender_party = actor_party(&payment.sender.address)?;
        let receiver_party = actor_party(&payment.receiver.address)?;
        let my_party = my_address.onchain_str();
        let other_party = other_address.onchain_str();
        let parties_match = (sender_party == my_party && receiver_party == other_party)
            || (sender_party == other_party && receiver_party == my_party);
        if !parties_match {
            return Err(PaymentLogicError::new(
                OffChainErrorCode::PaymentWrongActor,
                format!(
                    "wrong parties: expected {{{}, {}}} but got {{{}, {}}}",
                    my_party, other_party, sender_party, receiver_party
                ),
            )
            .into());
        }

        // The originator must be one of the channel parties
        let origin = command.origin.onchain_str();
        if origin != my_party && origin != other_party {
            return Err(PaymentLogicError::new(
                OffChainErrorCode::PaymentWrongActor,
                format!("command originates from wrong party {origin}"),
            )
            .into());
        }

        // Only check the commands we get from the peer
        if origin != other_party {
            return Ok(());
        }

        if command.is_new_payment() {
            // A new payment must be named by its originator
            match payment.reference_id.split_once(REFERENCE_ID_SEPARATOR) {
                Some((prefix, _)) if prefix == origin => {}
                _ => {
                    return Err(PaymentLogicError::new(
                        OffChainErrorCode::PaymentWrongStructure,
                        format!(
                            "expected reference_id of the form {}{}<suffix>, got: {}",
                            origin, REFERENCE_ID_SEPARATOR, payment.reference_id
                        ),
                    )
                    .into());
                }
            }
            self.check_new_payment(payment)
        } else {
            // The reference id is immutable across every read and write
            if command
                .reads_version_map
                .iter()
                .chain(command.writes_version_map.iter())
                .any(|(reference_id, _)| reference_id != &payment.reference_id)
            {
                return Err(PaymentLogicError::new(
                    OffChainErrorCode::PaymentWrongStructure,
                    "reference id changed between versions",
                )
                .into());
            }
            let previous = command.previous_version().ok_or_else(|| {
                PaymentLogicError::new(
                    OffChainErrorCode::PaymentWrongStructure,
                    "update command without a read dependency",
                )
            })?;
            let old_payment = self.store.get_object(previous)?;
            self.check_new_update(&old_payment, payment)
        }
    }

    /// Checks on the definition of a brand new payment from the peer
    fn check_new_payment(&self, payment: &PaymentObject) -> Result<(), ProcessorError> {
        let is_recipient = self.business.is_recipient(payment, None);
        if !good_initial_status(payment, is_recipient) {
            return Err(PaymentLogicError::new(
                OffChainErrorCode::PaymentWrongStatus,
                "sender set receiver status or vice-versa",
            )
            .into());
        }

        let sender = parse_actor_address(&payment.sender.address)?;
        let receiver = parse_actor_address(&payment.receiver.address)?;
        if sender.subaddress_bytes().is_none() {
            return Err(PaymentLogicError::new(
                OffChainErrorCode::PaymentInvalidSubaddress,
                format!(
                    "sender address needs to contain an encoded subaddress, but got {}",
                    sender.as_str()
                ),
            )
            .into());
        }
        if receiver.subaddress_bytes().is_none() {
            return Err(PaymentLogicError::new(
                OffChainErrorCode::PaymentInvalidSubaddress,
                format!(
                    "receiver address needs to contain an encoded subaddress, but got {}",
                    receiver.as_str()
                ),
            )
            .into());
        }

        self.check_signatures(payment)
    }

    /// Checks on an update of an existing payment from the peer
    fn check_new_update(
        &self,
        old_payment: &PaymentObject,
        new_payment: &PaymentObject,
    ) -> Result<(), ProcessorError> {
        let is_recipient = self.business.is_recipient(new_payment, None);
        let role = if is_recipient {
            PaymentRole::Receiver
        } else {
            PaymentRole::Sender
        };

        // Nothing on our side may be changed by the peer
        if old_payment.actor(role) != new_payment.actor(role) {
            return Err(PaymentLogicError::new(
                OffChainErrorCode::PaymentChangedOtherActor,
                format!("cannot change {} information", role.as_str()),
            )
            .into());
        }

        let other_status_new = new_payment.status_of(role.other());
        if !can_change_status(old_payment, other_status_new, role.other().is_sender()) {
            let other_status = old_payment.status_of(role.other());
            return Err(PaymentLogicError::new(
                OffChainErrorCode::PaymentWrongStatus,
                format!("invalid status transition: {other_status} -> {other_status_new}"),
            )
            .into());
        }

        self.check_signatures(new_payment)
    }

    /// Validate the recipient signature when we are the sender and one is
    /// attached to the payment
    fn check_signatures(&self, payment: &PaymentObject) -> Result<(), ProcessorError> {
        if self.business.is_sender(payment, None) && payment.recipient_signature.is_some() {
            if let Err(e) = self.business.validate_recipient_signature(payment) {
                return Err(PaymentLogicError::new(
                    OffChainErrorCode::PaymentWrongRecipientSignature,
                    format!("recipient signature check failed: {e}"),
                )
                .into());
            }
        }
        Ok(())
    }

    // ----- asynchronous command processing -----

    async fn process_command_failure(
        &self,
        other_address: OffChainAddress,
        command: PaymentCommand,
        cid: String,
        error: Option<OffChainError>,
    ) {
        let error = error.unwrap_or_else(|| {
            OffChainError::new(OffChainErrorCode::PaymentVaspError, "failure without detail")
        });
        error!("(other:{}) command {} failure: {}", other_address, cid, error);

        if command.origin != other_address {
            // One of our own commands failed: tell any outcome waiter
            self.set_payment_outcome_exception(
                &command.payment.reference_id,
                PaymentOutcomeError::Remote(error),
            );
        }
    }

    async fn process_command_success(
        &self,
        other_address: OffChainAddress,
        command: PaymentCommand,
        cid: String,
    ) {
        if let Err(e) = self
            .process_command_success_inner(&other_address, &command, &cid)
            .await
        {
            match e {
                ProcessorError::Network(NetworkError::Transport(msg)) => {
                    warn!("(other:{}) network error on {}: {}", other_address, cid, msg);
                }
                other => {
                    error!(
                        "(other:{}) payment processing error on {}: {}",
                        other_address, cid, other
                    );
                }
            }
        }
    }

    async fn process_command_success_inner(
        &self,
        other_address: &OffChainAddress,
        command: &PaymentCommand,
        cid: &str,
    ) -> Result<(), ProcessorError> {
        let net = self
            .net
            .get()
            .cloned()
            .ok_or(ProcessorError::NetworkNotSet)?;

        let payment = command.payment.clone();
        self.set_payment_outcome(&payment);

        info!("(other:{}) process command {}", other_address, cid);
        let ctx = self
            .business
            .payment_pre_processing(other_address, cid, command, &payment)
            .await?;

        // Only respond to commands created by the other side
        if &command.origin != other_address {
            return Ok(());
        }

        let new_payment = self.payment_process(&payment, Some(&ctx)).await?;
        if new_payment.differs_from(&payment) {
            let new_command = PaymentCommand::new(new_payment, self.business.get_my_address());
            let request = net.sequence_command(other_address, new_command).await?;
            net.send_request(other_address, request).await?;
        } else {
            // Our turn, but no progress was made: hint any waiter to come
            // back with fresh business input.
            self.set_payment_outcome_exception(
                &payment.reference_id,
                PaymentOutcomeError::NoProgress,
            );
            let role = if self.business.is_recipient(&new_payment, Some(&ctx)) {
                "receiver"
            } else {
                "sender"
            };
            debug!(
                "(me:{} other:{}) no further command for {} after {}",
                role, other_address, payment.reference_id, cid
            );
        }
        Ok(())
    }

    /// Process a payment we just committed and return a new version of it.
    /// The returned snapshot carries no semantic change when there is
    /// nothing to say, which emits no command.
    pub async fn payment_process(
        &self,
        payment: &PaymentObject,
        ctx: Option<&B::Context>,
    ) -> Result<PaymentObject, ProcessorError> {
        let is_recipient = self.business.is_recipient(payment, ctx);
        let role = if is_recipient {
            PaymentRole::Receiver
        } else {
            PaymentRole::Sender
        };

        let new_payment = payment.new_version();
        let version = new_payment.version.clone();

        let (mut new_payment, status) = match self
            .progress_payment(new_payment, payment, role, ctx)
            .await
        {
            Ok(Flow::Settled(unchanged)) => return Ok(unchanged),
            Ok(Flow::Progress {
                new_payment,
                current,
                abort_code,
                abort_message,
            }) => (
                new_payment,
                StatusObject {
                    status: current,
                    abort_code,
                    abort_message,
                },
            ),
            Err(BusinessError::ForceAbort { code, message }) => {
                // Discard any mutation made so far and restart from a
                // clean snapshot writing the same minted version.
                (
                    payment.new_version_with(version),
                    StatusObject::abort(code, message),
                )
            }
            Err(e) => {
                let error_ref = unique_id();
                error!(
                    "[{}] error while processing payment {}: {}",
                    error_ref, payment.reference_id, e
                );
                (
                    payment.new_version_with(version),
                    StatusObject::abort(
                        OffChainErrorCode::PaymentVaspError.to_string(),
                        format!(
                            "An unexpected exception was raised by the VASP business logic. Ref: {error_ref}"
                        ),
                    ),
                )
            }
        };

        // Internal consistency: the transition we are about to apply must
        // itself be a legal one.
        if !can_change_status(payment, status.status, role.is_sender()) {
            return Err(ProcessorError::InvalidStatusTransition {
                reference_id: payment.reference_id.clone(),
                sender: payment.status_of(PaymentRole::Sender),
                receiver: payment.status_of(PaymentRole::Receiver),
                new_status: status.status,
                role: role.as_str(),
            });
        }

        new_payment.actor_mut(role).change_status(status);
        Ok(new_payment)
    }

    async fn progress_payment(
        &self,
        mut new_payment: PaymentObject,
        payment: &PaymentObject,
        role: PaymentRole,
        ctx: Option<&B::Context>,
    ) -> Result<Flow, BusinessError> {
        let status = payment.status_of(role);
        let other_status = payment.status_of(role.other());
        let mut current = status;
        let mut abort_code = None;
        let mut abort_message = None;

        self.business.payment_initial_processing(payment, ctx).await?;

        if status.is_abort() || (status.is_ready() && other_status.is_ready()) {
            // Nothing more to be done with this payment
            return Ok(Flow::Settled(new_payment));
        }

        if other_status.is_abort() {
            current = Status::Abort;
            abort_code = Some("FOLLOW".to_owned());
            abort_message = Some("Follows the abort from the other side.".to_owned());
        }

        if current == Status::None {
            self.business
                .check_account_existence(&new_payment, ctx)
                .await?;
        }

        // Request more KYC data, or progress the protocol
        if matches!(
            current,
            Status::None
                | Status::NeedsKycData
                | Status::NeedsRecipientSignature
                | Status::SoftMatch
        ) {
            let next_kyc = self
                .business
                .next_kyc_level_to_request(&new_payment, ctx)
                .await?;
            if next_kyc != Status::None {
                current = next_kyc;
            }
        }

        // Provide the KYC artefacts the business wants to attach now
        let kyc_to_provide = self.business.next_kyc_to_provide(&new_payment, ctx).await?;

        if kyc_to_provide.contains(&Status::NeedsKycData) {
            let extended = self.business.get_extended_kyc(&new_payment, ctx).await?;
            new_payment.actor_mut(role).add_kyc_data(extended);
        }
        if kyc_to_provide.contains(&Status::SoftMatch) {
            let additional = self.business.get_additional_kyc(&new_payment, ctx).await?;
            new_payment
                .actor_mut(role)
                .add_additional_kyc_data(additional);
        }
        if kyc_to_provide.contains(&Status::NeedsRecipientSignature) {
            let signature = self
                .business
                .get_recipient_signature(&new_payment, ctx)
                .await?;
            new_payment.add_recipient_signature(signature);
        }

        // Check whether we now hold everything we need
        if !matches!(current, Status::ReadyForSettlement | Status::Abort) {
            if self.business.ready_for_settlement(&new_payment, ctx).await? {
                current = Status::ReadyForSettlement;
            }
        }

        Ok(Flow::Progress {
            new_payment,
            current,
            abort_code,
            abort_message,
        })
    }
}

impl<B: BusinessContext> CommandProcessor for PaymentProcessor<B> {
    fn check_command(
        &self,
        my_address: &OffChainAddress,
        other_address: &OffChainAddress,
        command: &PaymentCommand,
    ) -> Result<(), ProcessorError> {
        self.check_command_impl(my_address, other_address, command)
    }

    fn process_command(
        self: Arc<Self>,
        other_address: OffChainAddress,
        command: PaymentCommand,
        cid: String,
        success: bool,
        error: Option<OffChainError>,
    ) {
        let me = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            if success {
                me.process_command_success(other_address, command, cid).await;
            } else {
                me.process_command_failure(other_address, command, cid, error)
                    .await;
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }
}

/// On-chain party behind an actor address
fn actor_party(address: &str) -> Result<String, PaymentLogicError> {
    Ok(parse_actor_address(address)?.onchain_str())
}

fn parse_actor_address(address: &str) -> Result<OffChainAddress, PaymentLogicError> {
    OffChainAddress::from_encoded_str(address).map_err(|e| {
        PaymentLogicError::new(OffChainErrorCode::PaymentInvalidAddress, e.to_string())
    })
}
