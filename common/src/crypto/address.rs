use std::fmt;

use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::{ONCHAIN_ADDRESS_SIZE, SUBADDRESS_SIZE};
use crate::crypto::error::AddressError;

/// Address of a party in the off-chain protocol.
///
/// The on-chain part identifies the VASP itself, the optional subaddress
/// identifies an account below it. A channel endpoint is always an on-chain
/// only address, while payment actors carry the subaddress as well.
///
/// The encoded form is plain lowercase hex: 32 chars for an on-chain only
/// address, 48 chars when a subaddress is attached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OffChainAddress {
    onchain: [u8; ONCHAIN_ADDRESS_SIZE],
    subaddress: Option<[u8; SUBADDRESS_SIZE]>,
}

impl OffChainAddress {
    pub fn new(
        onchain: [u8; ONCHAIN_ADDRESS_SIZE],
        subaddress: Option<[u8; SUBADDRESS_SIZE]>,
    ) -> Self {
        Self {
            onchain,
            subaddress,
        }
    }

    /// Parse an address from its hex encoded form
    pub fn from_encoded_str(value: &str) -> Result<Self, AddressError> {
        let bytes = hex::decode(value)?;
        match bytes.len() {
            ONCHAIN_ADDRESS_SIZE => {
                let mut onchain = [0u8; ONCHAIN_ADDRESS_SIZE];
                onchain.copy_from_slice(&bytes);
                Ok(Self {
                    onchain,
                    subaddress: None,
                })
            }
            len if len == ONCHAIN_ADDRESS_SIZE + SUBADDRESS_SIZE => {
                let mut onchain = [0u8; ONCHAIN_ADDRESS_SIZE];
                onchain.copy_from_slice(&bytes[..ONCHAIN_ADDRESS_SIZE]);
                let mut subaddress = [0u8; SUBADDRESS_SIZE];
                subaddress.copy_from_slice(&bytes[ONCHAIN_ADDRESS_SIZE..]);
                Ok(Self {
                    onchain,
                    subaddress: Some(subaddress),
                })
            }
            len => Err(AddressError::InvalidLength(len)),
        }
    }

    /// Hex encoded form, including the subaddress when present
    pub fn as_str(&self) -> String {
        match &self.subaddress {
            Some(sub) => {
                let mut bytes = Vec::with_capacity(ONCHAIN_ADDRESS_SIZE + SUBADDRESS_SIZE);
                bytes.extend_from_slice(&self.onchain);
                bytes.extend_from_slice(sub);
                hex::encode(bytes)
            }
            None => hex::encode(self.onchain),
        }
    }

    /// The same party without its subaddress
    pub fn onchain_address(&self) -> Self {
        Self {
            onchain: self.onchain,
            subaddress: None,
        }
    }

    /// Hex encoded on-chain part only, the form used to name a party
    pub fn onchain_str(&self) -> String {
        hex::encode(self.onchain)
    }

    pub fn subaddress_bytes(&self) -> Option<&[u8; SUBADDRESS_SIZE]> {
        self.subaddress.as_ref()
    }

    /// Least significant bit of the on-chain part, used for the
    /// server/client role assignment of a channel
    pub fn last_bit(&self) -> u8 {
        self.onchain[ONCHAIN_ADDRESS_SIZE - 1] & 1
    }

    pub fn greater_than_or_equal(&self, other: &Self) -> bool {
        self >= other
    }
}

impl fmt::Display for OffChainAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for OffChainAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for OffChainAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_encoded_str(&value).map_err(D::Error::custom)
    }
}
