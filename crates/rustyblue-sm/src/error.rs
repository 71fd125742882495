//! Error types for the rustyblue-sm library
//!
//! Synchronous API misuse and resource exhaustion are reported through
//! [`SmError`]. Protocol level pairing failures are not errors in this sense;
//! they are delivered through the event handlers as
//! [`PairingFailure`](crate::smp::PairingFailure) values.

use thiserror::Error;

/// Errors returned by the security manager, its database and the PAL
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SmError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation not implemented for this transport or role")]
    NotImplemented,

    #[error("Requested record not found")]
    NotFound,

    #[error("Security manager has not been initialized")]
    NotInitialized,

    #[error("Operation already in progress")]
    Busy,

    #[error("Out of resources: {0}")]
    NoResources(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt security database: {0}")]
    CorruptDatabase(String),

    #[error("Controller transport error: {0}")]
    Transport(String),
}

impl From<std::io::Error> for SmError {
    fn from(err: std::io::Error) -> Self {
        SmError::Storage(err.to_string())
    }
}

/// Result type for security manager operations
pub type SmResult<T> = Result<T, SmError>;
