//! Trap Transport Layer
//!
//! This crate provides the transport side of Trap:
//! - The [`Transport`] contract and [`TransportDelegate`] callbacks
//! - [`TransportCore`], the state machine every transport shares
//! - Authentication hooks ([`Authentication`])
//! - Loopback (in-process) and socket (raw TCP) transports
//! - [`TransportRegistry`], the static table endpoints are built from

pub mod auth;
pub mod base;
pub mod error;
pub mod registry;
pub mod traits;

#[cfg(feature = "loopback")]
pub mod loopback;

#[cfg(feature = "socket")]
pub mod socket;

pub use auth::{Authentication, NullAuthentication, SharedSecretAuthentication};
pub use base::{TransportCore, CONNECTION_TIMEOUT, DEFAULT_KEEPALIVE_EXPIRY};
pub use error::{Result, TransportError};
pub use registry::TransportRegistry;
pub use traits::{
    ListenerDelegate, ListenerTransport, Transport, TransportDelegate, TransportHandle,
    TransportId, TransportState,
};

#[cfg(feature = "loopback")]
pub use loopback::{LoopbackListener, LoopbackTransport};

#[cfg(feature = "socket")]
pub use socket::{SocketConfig, SocketListener, SocketTransport};
