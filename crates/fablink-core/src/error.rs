//! Error handling for FabLink
//!
//! Provides error types for every layer of the connection core:
//! - Connection errors (transport loss, heartbeat timeout)
//! - Protocol errors (binary result codes, malformed frames)
//! - Detection errors (no protocol identified)
//! - Transfer errors (file upload failures)
//! - Channel errors (unsupported capability, closed channel)
//!
//! All error types use `thiserror` for ergonomic error handling.

use crate::data::Protocol;
use thiserror::Error;

/// Connection error type
///
/// Represents transport-level failures. Heartbeat timeouts are a distinct
/// kind so callers can tell "the socket told us" from "we inferred it".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The transport reported close or error
    #[error("Connection closed: {reason}")]
    ConnectionClosed {
        /// The reason reported by the transport.
        reason: String,
    },

    /// No heartbeat arrived within the liveness window
    #[error("Heartbeat timeout after {timeout_ms}ms")]
    HeartbeatTimeout {
        /// The liveness window in milliseconds.
        timeout_ms: u64,
    },

    /// Connection timeout
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Failed to open port or socket
    #[error("Failed to open {target}: {reason}")]
    FailedToOpen {
        /// The port path or address that failed to open.
        target: String,
        /// The reason the open failed.
        reason: String,
    },

    /// The handshake with the machine was refused
    #[error("Handshake rejected: {reason}")]
    HandshakeRejected {
        /// The reason the handshake failed.
        reason: String,
    },

    /// Serial port error
    #[error("Serial port error: {reason}")]
    SerialError {
        /// The reason for the serial port error.
        reason: String,
    },

    /// HTTP transport error
    #[error("HTTP error: {reason}")]
    HttpError {
        /// The reason for the HTTP error.
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {reason}")]
    IoError {
        /// The reason for the I/O error.
        reason: String,
    },
}

impl ConnectionError {
    /// Shorthand for a closed connection
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }
}

/// Binary protocol error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The machine answered with a non-zero result code
    #[error("Command {command_set:#04x}/{command_id:#04x} failed with result code {code}")]
    ResultCode {
        /// Command set of the failed request.
        command_set: u8,
        /// Command id of the failed request.
        command_id: u8,
        /// Result code returned by the machine.
        code: u8,
    },

    /// No correlated response arrived in time
    #[error("Request {command_set:#04x}/{command_id:#04x} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Command set of the request.
        command_set: u8,
        /// Command id of the request.
        command_id: u8,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// A payload could not be decoded
    #[error("Malformed payload: {reason}")]
    MalformedPayload {
        /// What was wrong with the payload.
        reason: String,
    },

    /// A payload is too large for a single frame
    #[error("Payload of {size} bytes exceeds the frame limit of {limit}")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Frame limit.
        limit: usize,
    },

    /// Too many consecutive unparseable frames
    #[error("Byte stream corrupt: {count} consecutive bad frames")]
    CorruptStream {
        /// Number of consecutive corrupt frames.
        count: u32,
    },
}

/// Detection error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
    /// No probe succeeded
    #[error("Could not identify machine at {target}")]
    UnknownMachine {
        /// The address or device path that was probed.
        target: String,
    },

    /// The probe itself could not run
    #[error("Probe of {target} failed: {reason}")]
    ProbeFailed {
        /// The address or device path that was probed.
        target: String,
        /// Why the probe failed.
        reason: String,
    },
}

/// File transfer error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The machine rejected or aborted the transfer
    #[error("Transfer of {filename} failed: {reason}")]
    Rejected {
        /// The file being transferred.
        filename: String,
        /// Human readable reason.
        reason: String,
    },

    /// Checksum reported by the machine does not match
    #[error("Checksum mismatch for {filename}")]
    ChecksumMismatch {
        /// The file being transferred.
        filename: String,
    },

    /// The file could not be read or compressed
    #[error("Cannot prepare {filename}: {reason}")]
    Source {
        /// The file being transferred.
        filename: String,
        /// Why preparation failed.
        reason: String,
    },

    /// The file does not fit the chunk counter
    #[error("File {filename} is too large ({size} bytes)")]
    TooLarge {
        /// The file being transferred.
        filename: String,
        /// File size.
        size: u64,
    },
}

impl TransferError {
    /// Human readable reason for a transfer result code
    pub fn describe_result(code: u8) -> &'static str {
        match code {
            0 => "success",
            1 => "checksum mismatch",
            2 => "SD card unavailable",
            3 => "storage full",
            4 => "transfer cancelled by machine",
            _ => "unknown failure",
        }
    }
}

/// Channel error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// No channel is open
    #[error("Channel not open")]
    NotOpen,

    /// Operation not available on this protocol
    #[error("{operation} is not supported over {protocol}")]
    Unsupported {
        /// The operation requested.
        operation: String,
        /// The active protocol.
        protocol: Protocol,
    },

    /// A required module is not attached
    #[error("No {module} module attached")]
    ModuleMissing {
        /// The logical module name.
        module: String,
    },

    /// Command was rejected by the machine
    #[error("Command rejected: {reason}")]
    CommandRejected {
        /// The reason the command was rejected.
        reason: String,
    },

    /// Invalid argument for a command
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the argument.
        reason: String,
    },
}

impl ChannelError {
    /// Shorthand for an unsupported operation
    pub fn unsupported(operation: impl Into<String>, protocol: Protocol) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            protocol,
        }
    }
}

/// Main error type for FabLink
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Detection error
    #[error(transparent)]
    Detection(#[from] DetectionError),

    /// Transfer error
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Channel error
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Protocol(ProtocolError::RequestTimeout { .. })
                | Error::Connection(ConnectionError::ConnectionTimeout { .. })
                | Error::Connection(ConnectionError::HeartbeatTimeout { .. })
        )
    }

    /// Check if this error means the connection is gone
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError::ConnectionClosed { .. })
                | Error::Connection(ConnectionError::HeartbeatTimeout { .. })
                | Error::Protocol(ProtocolError::CorruptStream { .. })
        )
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this is a protocol error
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Result code carried by a protocol error, if any
    pub fn result_code(&self) -> Option<u8> {
        match self {
            Error::Protocol(ProtocolError::ResultCode { code, .. }) => Some(*code),
            _ => None,
        }
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_timeout_is_distinct_from_close() {
        let timeout: Error = ConnectionError::HeartbeatTimeout { timeout_ms: 10_000 }.into();
        let closed: Error = ConnectionError::closed("socket reset").into();

        assert!(timeout.is_connection_lost());
        assert!(closed.is_connection_lost());
        assert!(timeout.is_timeout());
        assert!(!closed.is_timeout());
        assert!(matches!(
            timeout,
            Error::Connection(ConnectionError::HeartbeatTimeout { .. })
        ));
    }

    #[test]
    fn test_result_code_extraction() {
        let err: Error = ProtocolError::ResultCode {
            command_set: 0x10,
            command_id: 0x02,
            code: 7,
        }
        .into();
        assert_eq!(err.result_code(), Some(7));
        assert!(err.is_protocol_error());
        assert!(!err.is_connection_lost());
        assert_eq!(
            err.to_string(),
            "Command 0x10/0x02 failed with result code 7"
        );
    }

    #[test]
    fn test_unsupported_message() {
        let err = ChannelError::unsupported("spindle speed", Protocol::Http);
        assert_eq!(err.to_string(), "spindle speed is not supported over http");
    }

    #[test]
    fn test_transfer_reason() {
        assert_eq!(TransferError::describe_result(2), "SD card unavailable");
        assert_eq!(TransferError::describe_result(99), "unknown failure");
    }
}
