// error.rs - Error types for the agent and the transport seam

use crate::SipParseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No route to {0}")]
    NoRoute(String),

    #[error("Connection closed")]
    Closed,

    #[error("Message too large: {0} bytes")]
    TooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] SipParseError),

    #[error("Transaction already exists: {0}")]
    TransactionExists(String),

    #[error("Transaction already terminated")]
    TransactionTerminated,

    #[error("Transaction limit reached ({0})")]
    LimitExceeded(usize),

    #[error("No such dialog")]
    NoSuchDialog,

    #[error("Dialog already exists")]
    DialogExists,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, SipError>;
