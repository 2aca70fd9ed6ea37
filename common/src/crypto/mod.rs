mod address;
mod error;

pub mod random;

pub use address::*;
pub use error::AddressError;
