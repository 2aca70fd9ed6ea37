use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("Invalid address length: {0} bytes")]
    InvalidLength(usize),
}
