//! Migration error types
//!
//! Every migration fault is local to the connection that raised it. Only
//! [`MigrationError::ProtocolViolation`] and [`MigrationError::ConnectionClosed`]
//! describe conditions that end a connection.

use thiserror::Error;

use crate::path::PathId;

/// Errors raised by the frame and transport parameter codecs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Unexpected end of input while decoding {0}")]
    UnexpectedEnd(&'static str),

    #[error("Unknown frame type: {0:#x}")]
    UnknownFrameType(u64),

    #[error("Invalid connection ID length: {0}")]
    InvalidConnectionIdLength(usize),

    #[error("Varint value out of range: {0}")]
    VarIntRange(u64),

    #[error("Malformed {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Error)]
pub enum MigrationError {
    #[error("Unknown connection ID")]
    UnknownConnectionId,

    #[error("PATH_RESPONSE does not match an outstanding challenge for {0}")]
    StaleOrMismatchedToken(PathId),

    #[error("Path validation exhausted for {path} after {attempts} attempts")]
    ValidationExhausted { path: PathId, attempts: u32 },

    #[error("Active connection ID limit of {limit} reached")]
    CidLimitExceeded { limit: u64 },

    #[error("Amplification budget exceeded: requested {requested} bytes, {available} available")]
    AmplificationBudgetExceeded { requested: u64, available: u64 },

    #[error("{0} is not validated")]
    PathNotValidated(PathId),

    #[error("Unknown path: {0}")]
    UnknownPath(PathId),

    #[error("No connection ID with sequence number {0}")]
    UnknownSequence(u64),

    #[error("Connection ID length {0} exceeds maximum of 20")]
    ConnectionIdTooLong(usize),

    #[error("No unused {0}-byte connection ID left to issue")]
    ConnectionIdSpaceExhausted(usize),

    #[error("No unused peer connection ID available")]
    NoPeerConnectionId,

    #[error("Too many paths: limit is {0}")]
    PathLimit(usize),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection migration disabled")]
    MigrationDisabled,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for MigrationError {
    fn from(err: config::ConfigError) -> Self {
        MigrationError::Config(err.to_string())
    }
}

impl MigrationError {
    /// Whether this error terminates the connection
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrationError::ProtocolViolation(_) | MigrationError::ConnectionClosed
        )
    }

    /// Errors that should be dropped silently rather than reported
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            MigrationError::UnknownConnectionId | MigrationError::StaleOrMismatchedToken(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_faults_are_local() {
        assert!(!MigrationError::UnknownConnectionId.is_fatal());
        assert!(!MigrationError::ValidationExhausted { path: PathId(1), attempts: 3 }.is_fatal());
        assert!(!MigrationError::CidLimitExceeded { limit: 2 }.is_fatal());
        assert!(
            !MigrationError::AmplificationBudgetExceeded { requested: 10, available: 0 }.is_fatal()
        );
        assert!(MigrationError::ConnectionClosed.is_fatal());
        assert!(MigrationError::ProtocolViolation("bad".into()).is_fatal());
    }

    #[test]
    fn test_codec_error_conversion() {
        let err: MigrationError = CodecError::UnknownFrameType(0x40).into();
        assert!(matches!(err, MigrationError::Codec(CodecError::UnknownFrameType(0x40))));
        assert_eq!(err.to_string(), "Codec error: Unknown frame type: 0x40");
    }
}
