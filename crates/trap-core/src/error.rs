//! Error types for Trap core

use thiserror::Error;

/// Result type alias for Trap core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Trap core error types
#[derive(Error, Debug)]
pub enum Error {
    /// Operation code not known to this protocol version
    #[error("unknown operation code: {0}")]
    UnknownOperation(u8),

    /// Authentication data does not fit the 16-bit length field
    #[error("auth data too large: {0} bytes (max 65535)")]
    AuthDataTooLarge(usize),

    /// A length field in a header is negative or otherwise unusable
    #[error("invalid frame length: {0}")]
    InvalidLength(i64),

    /// Auth data was not valid UTF-8
    #[error("invalid auth data encoding: {0}")]
    InvalidAuthData(#[from] std::string::FromUtf8Error),

    /// Payload could not be inflated
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Payload could not be deflated
    #[error("compression failed: {0}")]
    Compression(String),

    /// A field value cannot be represented in the chosen format
    #[error("value out of range for {field}: {value}")]
    OutOfRange { field: &'static str, value: i64 },

    /// Generic protocol error
    #[error("protocol error: {0}")]
    Protocol(String),
}
