//! Error kinds of the overlay protocol
//!
//! Transport-level failures close only the affected conduit; circuits die
//! with their own active conduit. Nothing here retries.

use thiserror::Error;

use onionp2p_hashcash::HashcashError;
use onionp2p_network::NetworkError;

#[derive(Error, Debug)]
pub enum OnionError {
    /// Unknown variant, variant not valid in the current state, or a
    /// malformed frame.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The underlying conduit delivered fewer bytes than the frame header
    /// promised.
    #[error("truncated frame: expected {expected} bytes")]
    Truncated { expected: u64 },

    /// The first message on a fresh session was not a noise upgrade.
    #[error("connection not secured")]
    NotSecured,

    /// An external dial was requested on a relay not running in exit mode.
    #[error("this peer does not support exit mode")]
    ExitDisabled,

    /// A hidden-service dial named an address no live bind is serving.
    #[error("hidden service not hosted here")]
    NotHosted,

    /// The message's hashcash token did not verify.
    #[error("proof of work invalid: {0}")]
    PowInvalid(#[from] HashcashError),

    /// A bind's signature did not verify the public key over the address.
    #[error("hidden service signature invalid")]
    SignatureInvalid,

    /// DHT, dial, or substrate failure.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Deadline elapsed or caller-initiated shutdown.
    #[error("operation canceled")]
    Canceled,

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl From<NetworkError> for OnionError {
    fn from(e: NetworkError) -> Self {
        OnionError::Upstream(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for OnionError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        OnionError::Canceled
    }
}

pub type Result<T> = std::result::Result<T, OnionError>;
