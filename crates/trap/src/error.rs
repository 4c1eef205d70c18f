//! Endpoint error types

use crate::state::EndpointState;
use thiserror::Error;
use trap_transport::TransportError;

pub type Result<T> = std::result::Result<T, TrapError>;

#[derive(Error, Debug)]
pub enum TrapError {
    #[error("endpoint cannot do that in state {0}")]
    InvalidState(EndpointState),

    #[error("outgoing queue is full")]
    QueueFull,

    #[error("channel was drained while waiting for queue space")]
    ChannelClosed,

    #[error("message id {0} is past the receive window")]
    BufferOverflow(u32),

    #[error("message id {0} is outside the id range")]
    InvalidMessageId(u32),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no transports available")]
    NoTransports,

    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    #[error("no tokio runtime to schedule tasks on")]
    NoRuntime,

    #[error("timeout")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Core(#[from] trap_core::Error),

    #[error("{0}")]
    Other(String),
}
