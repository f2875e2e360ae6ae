//! Error types and result definitions for the tuyalan crate.
//! Includes retryability classification used by the retry executor.

use thiserror::Error;

/// Represents all possible errors that can occur when communicating with a Tuya device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TuyaError {
    /// Standard IO error (socket read/write failure)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Failed to decode hex or byte-level data
    #[error("Decode error: {0}")]
    Decode(String),

    /// Failed to encrypt a message for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Failed to decrypt a message from the device (wrong key, length, or padding)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Bad prefix, suffix, or declared length in a received frame
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// CRC check failed for the received message (v3.1 - v3.3)
    #[error("CRC mismatch")]
    CrcMismatch,

    /// HMAC signature verification failed (v3.4)
    #[error("HMAC mismatch")]
    HmacMismatch,

    /// The decoded command code is not recognised
    #[error("Unknown command code 0x{0:02x}")]
    UnknownCommand(u32),

    /// A send was issued while the connection was not in the Connected state
    #[error("Not connected")]
    NotConnected,

    /// No response arrived within the response timeout
    #[error("Timeout waiting for response")]
    ResponseTimeout,

    /// Connection establishment exceeded the connection timeout
    #[error("Connection timed out")]
    ConnectTimeout,

    /// TCP connection could not be established
    #[error("Socket connection failed")]
    ConnectionFailed,

    /// The connection was torn down while a request was in flight
    #[error("Connection closed")]
    ConnectionClosed,

    /// Protocol version 3.5 or an unknown version string
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// The command cannot be encoded for the configured protocol version
    /// (v3.1 CONTROL)
    #[error("Command not supported for this protocol version")]
    UnsupportedCommandVariant,
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        TuyaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl TuyaError {
    /// Whether this error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TuyaError::Io(_)
                | TuyaError::ConnectionFailed
                | TuyaError::ConnectTimeout
                | TuyaError::ResponseTimeout
        )
    }
}
