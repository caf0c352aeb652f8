//! Crate-wide error type

use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    #[error("No stored credentials")]
    NoCredentials,
    #[error("Wrong argument count: expected {expected}, got {got}")]
    ArityMismatch { expected: usize, got: usize },
    #[error("Unknown command")]
    UnknownCommand,
    #[error("Nothing supplied")]
    EmptyCommand,
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Network unreachable")]
    NetworkUnreachable,
    #[error("Unexpected HTTP status {0}")]
    UnexpectedStatus(u16),
    #[error("Malformed server response")]
    ParseFailure,
    #[error("Connection timed out")]
    ConnectionTimeout,
    #[error("Stream not connected")]
    NotConnected,
    #[error("Sensor not ready")]
    SensorNotReady,
    #[error("Storage failure")]
    Storage,
}

pub type Result<T> = core::result::Result<T, ProbeError>;
