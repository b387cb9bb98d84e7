//! Error definitions for the lantern link

use std::path::PathBuf;
use std::sync::PoisonError;
use thiserror::Error;

/// Lantern error types
#[derive(Error, Debug)]
pub enum LanternError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema file not found: {}", .0.display())]
    SchemaNotFound(PathBuf),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Cannot encode packet: {0}")]
    Encode(String),

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(i64),

    #[error("Unknown command id: {0}")]
    UnknownCommand(i64),

    #[error("Unknown error code: {0}")]
    UnknownErrorCode(i64),

    #[error("Unknown error name: {0}")]
    UnknownErrorName(String),

    #[error("CRC mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch { expected: u32, computed: u32 },

    #[error("Command rejected with {0}")]
    Rejected(String),

    #[error("Timeout")]
    Timeout,

    #[error("Driver not connected")]
    NotConnected,

    #[error("No command has been sent")]
    NoCommand,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Lock poisoned: {0}")]
    Lock(String),

    #[error("Incomplete reply: {0}")]
    Incomplete(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl LanternError {
    pub fn schema(msg: impl Into<String>) -> Self {
        LanternError::Schema(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        LanternError::Malformed(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        LanternError::Encode(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        LanternError::Transport(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        LanternError::InvalidArgument(msg.into())
    }
}

impl<T> From<PoisonError<T>> for LanternError {
    fn from(e: PoisonError<T>) -> Self {
        LanternError::Lock(e.to_string())
    }
}

/// Result type alias for lantern operations
pub type LanternResult<T> = Result<T, LanternError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LanternError::Config("test".to_string());
        assert_eq!(format!("{}", err), "Configuration error: test");
    }

    #[test]
    fn test_rejected_carries_name() {
        let err = LanternError::Rejected("ERR_BUSY".to_string());
        assert!(err.to_string().contains("ERR_BUSY"));
    }

    #[test]
    fn test_crc_mismatch_display() {
        let err = LanternError::CrcMismatch { expected: 0x1234, computed: 0xdeadbeef };
        assert_eq!(
            err.to_string(),
            "CRC mismatch: expected 0x00001234, computed 0xdeadbeef"
        );
    }
}
