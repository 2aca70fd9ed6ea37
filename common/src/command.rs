// A command is the unit of agreement between the two parties: it writes
// exactly one new payment version and declares the prior versions it
// depends on. The channel only commits a command once its dependencies are
// present and unconsumed on both sides.

use serde::{Deserialize, Serialize};

use crate::crypto::OffChainAddress;
use crate::payment::PaymentObject;

/// Pair of (reference_id, version) naming one object version
pub type VersionRef = (String, String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCommand {
    /// The new payment snapshot this command introduces
    pub payment: PaymentObject,
    /// Versions that must exist and be unconsumed for the command to apply
    pub reads_version_map: Vec<VersionRef>,
    /// Versions the command introduces, exactly one for payments
    pub writes_version_map: Vec<VersionRef>,
    /// Party that created the command
    pub origin: OffChainAddress,
}

impl PaymentCommand {
    /// Wrap a payment snapshot into a command. The dependency maps are
    /// derived from the snapshot ancestry: an initial snapshot reads
    /// nothing, a new version reads its predecessor.
    pub fn new(payment: PaymentObject, origin: OffChainAddress) -> Self {
        let reads_version_map = payment
            .previous_version
            .iter()
            .map(|previous| (payment.reference_id.clone(), previous.clone()))
            .collect();
        let writes_version_map = vec![(payment.reference_id.clone(), payment.version.clone())];
        Self {
            payment,
            reads_version_map,
            writes_version_map,
            origin,
        }
    }

    /// Build a command with explicit dependency maps
    pub fn from_parts(
        payment: PaymentObject,
        reads_version_map: Vec<VersionRef>,
        writes_version_map: Vec<VersionRef>,
        origin: OffChainAddress,
    ) -> Self {
        Self {
            payment,
            reads_version_map,
            writes_version_map,
            origin,
        }
    }

    /// Versions this command depends on
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.reads_version_map.iter().map(|(_, version)| version.as_str())
    }

    /// Versions this command introduces
    pub fn new_object_versions(&self) -> impl Iterator<Item = &str> {
        self.writes_version_map.iter().map(|(_, version)| version.as_str())
    }

    /// Version of the snapshot this command updates, if any
    pub fn previous_version(&self) -> Option<&str> {
        self.reads_version_map.first().map(|(_, version)| version.as_str())
    }

    /// True for the definition of a brand new payment
    pub fn is_new_payment(&self) -> bool {
        self.reads_version_map.is_empty()
    }
}
