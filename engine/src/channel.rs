// Pairwise channel between two parties.
//
// Both endpoints may sequence commands concurrently; the channel brings
// them into a single total order through dependency locks on shared object
// versions and a deterministic server/client tie-break. Requests are
// retransmitted until an outcome is known and every outcome other than
// `wait` is durable, so retransmission is idempotent on both sides.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use offchain_common::api::{
    CommandRequestObject, CommandResponseObject, CommandStatus, OffChainError, OffChainErrorCode,
};
use offchain_common::command::PaymentCommand;
use offchain_common::crypto::OffChainAddress;

use crate::processor::{CommandProcessor, ProcessorError};
use crate::signer::{EnvelopeSigner, SignatureError};
use crate::storage::{Database, StorableDict, StorableFactory, StorageError};
use crate::store::PaymentStore;

/// State of one object version with respect to the channel locks.
///
/// A version becomes `Available` when written by a committed command, is
/// `Held` while a locally pending command reads it, and ends `Expired`
/// once a committed command has consumed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Available,
    Expired,
    Held(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer reported a failure for one of our commands
    #[error("peer reported failure: {0}")]
    Remote(OffChainError),
    /// A local command could not be sequenced, pick different dependencies
    #[error("dependency failure: missing {missing:?}, used {used:?}, locked {locked:?}")]
    Dependency {
        missing: Vec<String>,
        used: Vec<String>,
        locked: Vec<String>,
    },
    /// Programmer or peer protocol invariant breach, never suppressed
    #[error("protocol invariant violated: {0}")]
    Invariant(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("envelope error: {0}")]
    Signature(#[from] SignatureError),
    #[error("malformed message: {0}")]
    Parse(#[from] serde_json::Error),
}

struct ChannelState {
    // cid -> committed command with its response, append only
    committed_commands: StorableDict<CommandRequestObject>,
    // zero padded sequence number -> cid, the commit order used for replay
    command_sequence: StorableDict<String>,
    // cid -> request we originated and still wait an outcome for
    my_pending_requests: StorableDict<CommandRequestObject>,
    // object version -> lock state
    object_locks: StorableDict<LockState>,
    // retransmission order of the pending cids, rebuilt on restart
    pending_order: Vec<String>,
}

pub struct VaspPairChannel {
    my_address: OffChainAddress,
    other_address: OffChainAddress,
    processor: Arc<dyn CommandProcessor>,
    signer: Arc<dyn EnvelopeSigner>,
    store: Arc<PaymentStore>,
    state: Mutex<ChannelState>,
}

impl VaspPairChannel {
    pub fn new(
        my_address: OffChainAddress,
        other_address: OffChainAddress,
        processor: Arc<dyn CommandProcessor>,
        signer: Arc<dyn EnvelopeSigner>,
        store: Arc<PaymentStore>,
        db: Arc<dyn Database>,
    ) -> Result<Self, ChannelError> {
        if my_address == other_address {
            return Err(ChannelError::Invariant(
                "cannot open a channel to our own address".to_owned(),
            ));
        }

        let factory = StorableFactory::new(db);
        let root = factory.make_dir(&my_address.as_str(), None);
        let channels = factory.make_dir("channel", Some(&root));
        let peer = factory.make_dir(&other_address.as_str(), Some(&channels));

        let committed_commands = factory.make_dict("committed_commands", &peer);
        let command_sequence = factory.make_dict("command_sequence", &peer);
        let my_pending_requests: StorableDict<CommandRequestObject> =
            factory.make_dict("my_pending_requests", &peer);
        let object_locks = factory.make_dict("object_locks", &peer);

        // Requests that were pending when we last stopped keep being
        // retransmitted after a restart.
        let pending_order = my_pending_requests.keys()?;

        Ok(Self {
            my_address,
            other_address,
            processor,
            signer,
            store,
            state: Mutex::new(ChannelState {
                committed_commands,
                command_sequence,
                my_pending_requests,
                object_locks,
                pending_order,
            }),
        })
    }

    fn state(&self) -> Result<MutexGuard<'_, ChannelState>, ChannelError> {
        self.state
            .lock()
            .map_err(|_| ChannelError::Invariant("channel state lock poisoned".to_owned()))
    }

    pub fn my_address(&self) -> &OffChainAddress {
        &self.my_address
    }

    pub fn other_address(&self) -> &OffChainAddress {
        &self.other_address
    }

    pub fn store(&self) -> &Arc<PaymentStore> {
        &self.store
    }

    /// Role assignment is a pure function of the two endpoint addresses,
    /// used only to break ties on concurrent lock conflicts.
    pub fn is_server(&self) -> bool {
        if self.my_address.last_bit() ^ self.other_address.last_bit() == 1 {
            self.my_address > self.other_address
        } else {
            self.my_address < self.other_address
        }
    }

    pub fn is_client(&self) -> bool {
        !self.is_server()
    }

    pub fn role(&self) -> &'static str {
        if self.is_server() {
            "Server"
        } else {
            "Client"
        }
    }

    // ----- local command sequencing -----

    /// Sequence a command created on this side: lock its dependencies and
    /// register it for retransmission until the peer reports an outcome.
    pub fn sequence_command_local(
        &self,
        command: PaymentCommand,
    ) -> Result<CommandRequestObject, ChannelError> {
        let mut state = self.state()?;

        let (missing, used, locked) = self.classify_reads(&state, &command)?;
        if !missing.is_empty() || !used.is_empty() || !locked.is_empty() {
            return Err(ChannelError::Dependency {
                missing,
                used,
                locked,
            });
        }

        let request = CommandRequestObject::new(command);
        for version in request.command.dependencies() {
            state
                .object_locks
                .put(version, &LockState::Held(request.cid.clone()))?;
        }
        state.my_pending_requests.put(&request.cid, &request)?;
        state.pending_order.push(request.cid.clone());

        debug!(
            "(other:{}) sequenced local command {}",
            self.other_address, request.cid
        );
        Ok(request)
    }

    /// Sign a request into its wire envelope
    pub async fn package_request(
        &self,
        request: &CommandRequestObject,
    ) -> Result<String, ChannelError> {
        let payload = serde_json::to_string(&request.as_wire())?;
        Ok(self.signer.sign_message(&payload).await?)
    }

    // ----- responder side -----

    /// Verify and handle an incoming request envelope. Always produces a
    /// signed response envelope: validity failures are reported to the
    /// peer inside the response, never as a local error.
    pub async fn parse_handle_request(&self, envelope: &str) -> Result<String, ChannelError> {
        let response = match self.signer.verify_message(envelope).await {
            Ok(payload) => match serde_json::from_str::<CommandRequestObject>(&payload) {
                Ok(request) => self.handle_request(&request)?,
                Err(e) => {
                    warn!("(other:{}) unparseable request: {}", self.other_address, e);
                    CommandResponseObject::failure(
                        None,
                        OffChainError::new(OffChainErrorCode::ParsingError, e.to_string()),
                    )
                }
            },
            Err(e) => {
                warn!("(other:{}) invalid envelope: {}", self.other_address, e);
                CommandResponseObject::failure(
                    None,
                    OffChainError::new(OffChainErrorCode::InvalidSignature, e.to_string()),
                )
            }
        };

        let payload = serde_json::to_string(&response)?;
        Ok(self.signer.sign_message(&payload).await?)
    }

    /// Handle a request object from the peer and decide its outcome
    pub fn handle_request(
        &self,
        request: &CommandRequestObject,
    ) -> Result<CommandResponseObject, ChannelError> {
        let mut state = self.state()?;
        trace!(
            "(other:{}) handle request {}",
            self.other_address,
            request.cid
        );

        // Answer old requests with their recorded outcome
        if let Some(record) = state.committed_commands.try_get(&request.cid)? {
            if record.command == request.command {
                return record.response.ok_or_else(|| {
                    ChannelError::Invariant(format!(
                        "committed command {} has no stored response",
                        request.cid
                    ))
                });
            }
            // Same cid bound to different content: refuse, nothing to store
            return Ok(CommandResponseObject::failure(
                Some(request.cid.clone()),
                OffChainError::new(
                    OffChainErrorCode::Conflict,
                    "cid already bound to a different command",
                ),
            ));
        }

        let (missing, used, locked) = self.classify_reads(&state, &request.command)?;

        if !missing.is_empty() {
            let response = CommandResponseObject::failure(
                Some(request.cid.clone()),
                OffChainError::new(
                    OffChainErrorCode::MissingDependencies,
                    format!("missing dependencies: {}", missing.join(", ")),
                ),
            );
            self.record_failure(&mut state, request.as_wire(), response.clone())?;
            return Ok(response);
        }

        if !locked.is_empty() {
            if self.is_server() {
                // Server locks win: the client retries the same cid later
                debug!(
                    "(other:{}) request {} must wait on {:?}",
                    self.other_address, request.cid, locked
                );
                return Ok(CommandResponseObject::failure(
                    Some(request.cid.clone()),
                    OffChainError::new(
                        OffChainErrorCode::Wait,
                        "dependencies locked by the server, retry later",
                    ),
                ));
            }
            // We are the client side of the tie-break: our pending
            // commands yield their locks and fail locally.
            self.evict_lock_holders(&mut state, &locked)?;
        }

        if !used.is_empty() {
            // The response is recorded on both sides, so it carries the
            // bare code: the consumed versions only go to the log.
            debug!(
                "(other:{}) request {} conflicts on consumed {:?}",
                self.other_address, request.cid, used
            );
            let response = CommandResponseObject::failure(
                Some(request.cid.clone()),
                OffChainError::from_code(OffChainErrorCode::Conflict),
            );
            self.record_failure(&mut state, request.as_wire(), response.clone())?;
            return Ok(response);
        }

        // Payment level validation
        if let Err(error) =
            self.processor
                .check_command(&self.my_address, &self.other_address, &request.command)
        {
            return match error {
                ProcessorError::Logic(logic) => {
                    debug!(
                        "(other:{}) command {} rejected: {}",
                        self.other_address, request.cid, logic
                    );
                    let response = CommandResponseObject::failure(
                        Some(request.cid.clone()),
                        logic.into(),
                    );
                    self.record_failure(&mut state, request.as_wire(), response.clone())?;
                    Ok(response)
                }
                ProcessorError::Storage(e) => Err(ChannelError::Storage(e)),
                other => Err(ChannelError::Invariant(format!(
                    "command check failed: {other}"
                ))),
            };
        }

        let response = CommandResponseObject::success(request.cid.clone());
        self.commit(&mut state, request.as_wire(), response.clone())?;
        info!(
            "(other:{}) committed peer command {}",
            self.other_address, request.cid
        );
        Ok(response)
    }

    // ----- originator side -----

    /// Verify and handle a response envelope for one of our requests
    pub async fn parse_handle_response(&self, envelope: &str) -> Result<bool, ChannelError> {
        let payload = self.signer.verify_message(envelope).await?;
        let response: CommandResponseObject = serde_json::from_str(&payload)?;
        self.handle_response(&response)
    }

    /// Handle a response object. Returns true when it commits a pending
    /// command, false for a retransmit of an already decided one.
    pub fn handle_response(&self, response: &CommandResponseObject) -> Result<bool, ChannelError> {
        let mut state = self.state()?;
        let cid = response
            .cid
            .clone()
            .ok_or_else(|| ChannelError::Invariant("response carries no cid".to_owned()))?;
        trace!("(other:{}) handle response {}", self.other_address, cid);

        if state.committed_commands.contains(&cid)? {
            return Ok(false);
        }
        let Some(pending) = state.my_pending_requests.try_get(&cid)? else {
            return Err(ChannelError::Invariant(format!(
                "response for unknown request {cid}"
            )));
        };

        match response.status {
            CommandStatus::Success => {
                state.my_pending_requests.delete(&cid)?;
                state.pending_order.retain(|c| c != &cid);
                self.commit(&mut state, pending, response.clone())?;
                info!(
                    "(other:{}) committed local command {}",
                    self.other_address, cid
                );
                Ok(true)
            }
            CommandStatus::Failure => {
                let error = response.error.clone().ok_or_else(|| {
                    ChannelError::Invariant("failure response carries no error".to_owned())
                })?;
                if error.code == OffChainErrorCode::Wait {
                    // Transient flow control: stay pending, retry later
                    debug!(
                        "(other:{}) command {} told to wait",
                        self.other_address, cid
                    );
                    return Err(ChannelError::Remote(error));
                }

                // Permanent refusal: release our locks and record it
                warn!(
                    "(other:{}) command {} failed: {}",
                    self.other_address, cid, error
                );
                state.my_pending_requests.delete(&cid)?;
                state.pending_order.retain(|c| c != &cid);
                for version in pending.command.dependencies() {
                    if let Some(LockState::Held(holder)) = state.object_locks.try_get(version)? {
                        if holder == cid {
                            state.object_locks.put(version, &LockState::Available)?;
                        }
                    }
                }
                self.record_failure(&mut state, pending, response.clone())?;
                Err(ChannelError::Remote(error))
            }
        }
    }

    // ----- retransmission -----

    /// Requests we originated and still have no outcome for, in the order
    /// they were sequenced
    pub fn get_retransmit(&self) -> Result<Vec<CommandRequestObject>, ChannelError> {
        let state = self.state()?;
        let mut requests = Vec::with_capacity(state.pending_order.len());
        for cid in &state.pending_order {
            if let Some(request) = state.my_pending_requests.try_get(cid)? {
                requests.push(request);
            }
        }
        Ok(requests)
    }

    pub fn would_retransmit(&self) -> Result<bool, ChannelError> {
        Ok(!self.state()?.pending_order.is_empty())
    }

    pub fn pending_retransmit_number(&self) -> Result<usize, ChannelError> {
        Ok(self.state()?.pending_order.len())
    }

    // ----- recovery -----

    /// Replay every committed command, in commit order, through the
    /// processor. Called once after a restart so the processor can rebuild
    /// its run-time state and resume unfinished payments.
    pub fn replay_committed(&self) -> Result<usize, ChannelError> {
        let state = self.state()?;
        let mut sequence = state.command_sequence.keys()?;
        sequence.sort();

        let mut count = 0;
        for key in sequence {
            let cid = state.command_sequence.get(&key)?;
            let record = state.committed_commands.get(&cid)?;
            let success = record.is_success();
            let error = record.response.as_ref().and_then(|r| r.error.clone());
            Arc::clone(&self.processor).process_command(
                self.other_address.clone(),
                record.command,
                cid,
                success,
                error,
            );
            count += 1;
        }
        if count > 0 {
            info!(
                "(other:{}) replayed {} committed commands",
                self.other_address, count
            );
        }
        Ok(count)
    }

    // ----- introspection, used by tests and invariant checks -----

    /// Classify the reads of a request into (missing, used, locked)
    pub fn get_dep_locks(
        &self,
        request: &CommandRequestObject,
    ) -> Result<(Vec<String>, Vec<String>, Vec<String>), ChannelError> {
        let state = self.state()?;
        self.classify_reads(&state, &request.command)
    }

    pub fn committed_len(&self) -> Result<usize, ChannelError> {
        Ok(self.state()?.committed_commands.len()?)
    }

    pub fn committed_record(
        &self,
        cid: &str,
    ) -> Result<Option<CommandRequestObject>, ChannelError> {
        Ok(self.state()?.committed_commands.try_get(cid)?)
    }

    /// Cids in commit order
    pub fn committed_cids(&self) -> Result<Vec<String>, ChannelError> {
        let state = self.state()?;
        let mut sequence = state.command_sequence.keys()?;
        sequence.sort();
        let mut cids = Vec::with_capacity(sequence.len());
        for key in sequence {
            cids.push(state.command_sequence.get(&key)?);
        }
        Ok(cids)
    }

    pub fn pending_len(&self) -> Result<usize, ChannelError> {
        Ok(self.state()?.my_pending_requests.len()?)
    }

    pub fn lock_state(&self, version: &str) -> Result<Option<LockState>, ChannelError> {
        Ok(self.state()?.object_locks.try_get(version)?)
    }

    pub fn locked_versions(&self) -> Result<Vec<String>, ChannelError> {
        Ok(self.state()?.object_locks.keys()?)
    }

    // ----- internals -----

    fn classify_reads(
        &self,
        state: &ChannelState,
        command: &PaymentCommand,
    ) -> Result<(Vec<String>, Vec<String>, Vec<String>), ChannelError> {
        let mut missing = Vec::new();
        let mut used = Vec::new();
        let mut locked = Vec::new();
        for version in command.dependencies() {
            if !self.store.contains_object(version)? {
                missing.push(version.to_owned());
                continue;
            }
            match state.object_locks.try_get(version)? {
                Some(LockState::Expired) => used.push(version.to_owned()),
                Some(LockState::Held(_)) => locked.push(version.to_owned()),
                Some(LockState::Available) | None => {}
            }
        }
        Ok((missing, used, locked))
    }

    /// Evict the pending commands holding locks on `versions` after losing
    /// the tie-break: their locks revert to available and the commands are
    /// recorded as locally failed.
    fn evict_lock_holders(
        &self,
        state: &mut ChannelState,
        versions: &[String],
    ) -> Result<(), ChannelError> {
        let mut holders: Vec<String> = Vec::new();
        for version in versions {
            if let Some(LockState::Held(cid)) = state.object_locks.try_get(version)? {
                if !holders.contains(&cid) {
                    holders.push(cid);
                }
            }
        }

        for cid in holders {
            let Some(pending) = state.my_pending_requests.try_get(&cid)? else {
                continue;
            };
            debug!(
                "(other:{}) yielding pending command {} to the server",
                self.other_address, cid
            );
            for version in pending.command.dependencies() {
                if let Some(LockState::Held(holder)) = state.object_locks.try_get(version)? {
                    if holder == cid {
                        state.object_locks.put(version, &LockState::Available)?;
                    }
                }
            }
            state.my_pending_requests.delete(&cid)?;
            state.pending_order.retain(|c| c != &cid);

            // Recorded with the bare code, matching what the peer will
            // record for this cid once it sees the consumed versions.
            let response = CommandResponseObject::failure(
                Some(cid),
                OffChainError::from_code(OffChainErrorCode::Conflict),
            );
            self.record_failure(state, pending, response)?;
        }
        Ok(())
    }

    /// Record a permanent failure outcome for a command and notify the
    /// processor. Wait responses never reach this path.
    fn record_failure(
        &self,
        state: &mut ChannelState,
        request: CommandRequestObject,
        response: CommandResponseObject,
    ) -> Result<(), ChannelError> {
        let cid = request.cid.clone();
        let command = request.command.clone();
        let error = response.error.clone();
        let record = request.as_wire().into_record(response);
        state.committed_commands.put(&cid, &record)?;
        self.append_sequence(state, &cid)?;
        Arc::clone(&self.processor).process_command(
            self.other_address.clone(),
            command,
            cid,
            false,
            error,
        );
        Ok(())
    }

    /// Commit a successful command: record it, consume its reads, publish
    /// its writes and hand it to the processor.
    fn commit(
        &self,
        state: &mut ChannelState,
        request: CommandRequestObject,
        response: CommandResponseObject,
    ) -> Result<(), ChannelError> {
        let cid = request.cid.clone();
        let command = request.command.clone();
        let record = request.into_record(response);
        state.committed_commands.put(&cid, &record)?;
        self.append_sequence(state, &cid)?;

        for version in command.dependencies() {
            state.object_locks.put(version, &LockState::Expired)?;
        }
        self.store.insert_object(&command.payment)?;
        for version in command.new_object_versions() {
            state.object_locks.put(version, &LockState::Available)?;
        }
        self.store.advance_reference_id(&command)?;

        Arc::clone(&self.processor).process_command(
            self.other_address.clone(),
            command,
            cid,
            true,
            None,
        );
        Ok(())
    }

    fn append_sequence(&self, state: &ChannelState, cid: &str) -> Result<(), StorageError> {
        let seq = state.command_sequence.len()?;
        state
            .command_sequence
            .put(&format!("{:020}", seq), &cid.to_owned())
    }
}
