//! Trap Endpoints
//!
//! Sessions over any number of interchangeable transports.
//!
//! An endpoint multiplexes prioritised channels over whichever transport is
//! currently best, fragments large messages, and keeps the session alive
//! across transport loss: messages queue while it sleeps and go out in
//! order once a transport comes back.
//!
//! Three kinds of endpoint exist:
//! - [`ClientEndpoint`] connects out to a listener and recovers on its own
//! - [`ListenerEndpoint`] accepts clients, one server session each
//! - [`PeerEndpoint`] pairs with another peer through an application side channel
//!
//! # Example
//!
//! ```ignore
//! use trap::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let listener = ListenerEndpoint::builder().build()?;
//!     listener.listen(Delegates::new().on_accept(|session, _| {
//!         session.set_delegates(
//!             Delegates::new().on_data(|data, channel, _| println!("{} bytes on {}", data.len(), channel)),
//!             false,
//!         );
//!     }))?;
//!
//!     let client = ClientEndpoint::builder()
//!         .configuration(&listener.client_configuration_text(None))
//!         .build()?;
//!     client.connect(std::time::Duration::from_secs(5)).await?;
//!     client.send(&b"hello"[..], 1, false)?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod builder;
pub mod channel;
pub mod channel_queue;
pub mod client;
pub mod delegate;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod peer;
pub mod queue;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod state;

pub use builder::{ClientBuilder, ListenerBuilder, PeerBuilder};
pub use channel::Channel;
pub use client::ClientEndpoint;
pub use delegate::{Delegates, FailedPayload};
pub use endpoint::{Endpoint, EndpointKind, CLOSE_TIMEOUT};
pub use error::{Result, TrapError};
pub use listener::{ListenerEndpoint, PENDING_TIMEOUT};
pub use peer::{PeerEndpoint, SideChannel, PEER_ID_SENDER};
pub use queue::{MessageQueue, QueueFactory, QueueType};
pub use scheduler::{IdGenerator, Scheduler, TaskHandle, TokioScheduler, UuidGenerator};
pub use settings::EndpointSettings;
pub use state::EndpointState;

pub use trap_core;
pub use trap_transport;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::builder::{ClientBuilder, ListenerBuilder, PeerBuilder};
    pub use crate::client::ClientEndpoint;
    pub use crate::delegate::{Delegates, FailedPayload};
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{Result, TrapError};
    pub use crate::listener::ListenerEndpoint;
    pub use crate::peer::{PeerEndpoint, SideChannel};
    pub use crate::queue::QueueType;
    pub use crate::state::EndpointState;
    pub use trap_core::{Configuration, Format};
    pub use trap_transport::TransportRegistry;
}
