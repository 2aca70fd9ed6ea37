// Shared store of committed payment versions.
//
// The channel commit path is the only writer; the processor and the
// business layer read from it. Versions are append-only: once written they
// are never modified or removed.

use std::sync::Arc;

use log::trace;

use offchain_common::command::PaymentCommand;
use offchain_common::crypto::OffChainAddress;
use offchain_common::payment::PaymentObject;

use crate::storage::{Database, StorableDict, StorableFactory, StorageError};

pub struct PaymentStore {
    // version -> payment snapshot
    object_store: StorableDict<PaymentObject>,
    // reference_id -> latest committed version
    reference_id_index: StorableDict<String>,
}

impl PaymentStore {
    pub fn new(db: Arc<dyn Database>, my_address: &OffChainAddress) -> Self {
        let factory = StorableFactory::new(db);
        let root = factory.make_dir(&my_address.as_str(), None);
        let processor_dir = factory.make_dir("processor", Some(&root));
        Self {
            object_store: factory.make_dict("object_store", &processor_dir),
            reference_id_index: factory.make_dict("reference_id_index", &processor_dir),
        }
    }

    pub fn contains_object(&self, version: &str) -> Result<bool, StorageError> {
        self.object_store.contains(version)
    }

    pub fn try_get_object(&self, version: &str) -> Result<Option<PaymentObject>, StorageError> {
        self.object_store.try_get(version)
    }

    pub fn get_object(&self, version: &str) -> Result<PaymentObject, StorageError> {
        self.object_store.get(version)
    }

    /// Insert the payment snapshot written by a committed command
    pub fn insert_object(&self, payment: &PaymentObject) -> Result<(), StorageError> {
        trace!("store object version {}", payment.version);
        self.object_store.put(&payment.version, payment)
    }

    /// Latest committed version of a payment, if any
    pub fn latest_version(&self, reference_id: &str) -> Result<Option<String>, StorageError> {
        self.reference_id_index.try_get(reference_id)
    }

    /// Latest committed snapshot of a payment, if any
    pub fn latest_payment(&self, reference_id: &str) -> Result<Option<PaymentObject>, StorageError> {
        match self.latest_version(reference_id)? {
            Some(version) => Ok(Some(self.object_store.get(&version)?)),
            None => Ok(None),
        }
    }

    /// All committed snapshots of a payment, newest first
    pub fn payment_history(&self, reference_id: &str) -> Result<Vec<PaymentObject>, StorageError> {
        let mut history = Vec::new();
        let mut cursor = self.latest_version(reference_id)?;
        while let Some(version) = cursor {
            let payment = self.object_store.get(&version)?;
            cursor = payment.previous_version.clone();
            history.push(payment);
        }
        Ok(history)
    }

    /// Advance the reference id index for a freshly committed command.
    ///
    /// The entry only moves forward when the currently indexed version is
    /// among the command dependencies, so a command branching off an older
    /// version cannot rewind the index.
    pub fn advance_reference_id(&self, command: &PaymentCommand) -> Result<(), StorageError> {
        let payment = &command.payment;
        match self.reference_id_index.try_get(&payment.reference_id)? {
            Some(current) => {
                if command.dependencies().any(|version| version == current) {
                    self.reference_id_index
                        .put(&payment.reference_id, &payment.version)?;
                }
            }
            None => {
                self.reference_id_index
                    .put(&payment.reference_id, &payment.version)?;
            }
        }
        Ok(())
    }
}
