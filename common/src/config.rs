// Protocol-wide constants shared by every crate of the workspace.

// On-chain part of a party address, in bytes
pub const ONCHAIN_ADDRESS_SIZE: usize = 16;
// Subaddress designating an account below a party, in bytes
pub const SUBADDRESS_SIZE: usize = 8;

// Entropy of freshly minted object versions and request correlation ids.
// 16 bytes gives a 32 char hex string, collisions are not a practical concern.
pub const UNIQUE_ID_SIZE: usize = 16;

// Separator between the originating party and the payment-chosen suffix
// inside a reference id. Hex encoded addresses can never contain it.
pub const REFERENCE_ID_SEPARATOR: char = '_';
