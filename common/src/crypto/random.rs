// Random identifiers for object versions and request correlation ids.
//
// SECURITY: identifiers are exchanged with the peer and must not be
// predictable, so we use the OS CSPRNG and never thread_rng().

use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::UNIQUE_ID_SIZE;

/// Generate cryptographically secure random bytes
pub fn secure_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate a fresh globally-unique identifier, hex encoded
pub fn unique_id() -> String {
    hex::encode(secure_random_bytes::<UNIQUE_ID_SIZE>())
}
