//! Transport error types

use crate::TransportState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport not ready to send in state {0}")]
    InvalidState(TransportState),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("outgoing buffer full")]
    BufferFull,

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("accept failed: {0}")]
    AcceptFailed(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] trap_core::Error),

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// True for the plain "this transport cannot take the message right
    /// now" failures. Anything else means the transport is broken.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidState(_)
                | TransportError::ConnectionClosed
                | TransportError::BufferFull
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failure_classification() {
        assert!(TransportError::InvalidState(TransportState::Connecting).is_transport_failure());
        assert!(TransportError::BufferFull.is_transport_failure());
        assert!(!TransportError::SendFailed("x".into()).is_transport_failure());
        assert!(!TransportError::Protocol(trap_core::Error::UnknownOperation(7)).is_transport_failure());
    }
}
