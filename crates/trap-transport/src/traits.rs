//! Transport contract
//!
//! A transport is one physical way of carrying Trap messages between two
//! endpoints. Every transport embeds a [`TransportCore`] that owns the
//! shared state machine, authentication, transit tracking and liveness
//! probing; concrete transports only supply the link itself through
//! `connect`, `internal_send` and `internal_disconnect`.
//!
//! ```text
//!               connect()            OPEN/OPENED
//! DISCONNECTED ----------> CONNECTING ----> CONNECTED ----> AVAILABLE
//!      ^                                                      |   ^
//!      |             disconnect()                             v   |
//!      +------------ DISCONNECTING <-------------------- UNAVAILABLE
//!
//! any state --force_error()--> ERROR
//! ```

use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::warn;
use trap_core::{Configuration, Format, Message};

use crate::auth::Authentication;
use crate::base::TransportCore;
use crate::error::Result;

/// Shared handle to a transport
pub type TransportHandle = Arc<dyn Transport>;

/// Process-unique transport identity
pub type TransportId = u64;

/// Transport lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Available,
    Unavailable,
    Disconnecting,
    Error,
}

impl TransportState {
    /// Whether the link is up, whatever the endpoint thinks of it
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            TransportState::Connected | TransportState::Available | TransportState::Unavailable
        )
    }

    /// Terminal for the current link
    pub fn is_closed(self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Error)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Disconnected => "DISCONNECTED",
            TransportState::Connecting => "CONNECTING",
            TransportState::Connected => "CONNECTED",
            TransportState::Available => "AVAILABLE",
            TransportState::Unavailable => "UNAVAILABLE",
            TransportState::Disconnecting => "DISCONNECTING",
            TransportState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Receives everything a transport reports upwards.
///
/// Callbacks are never made while the transport holds one of its own locks.
pub trait TransportDelegate: Send + Sync {
    fn state_changed(
        &self,
        new_state: TransportState,
        old_state: TransportState,
        transport: &TransportHandle,
    );

    fn message_received(&self, message: Message, transport: &TransportHandle);

    /// A message left this transport for good (acknowledged or handed over)
    fn message_sent(&self, message: &Message, transport: &TransportHandle);

    /// Messages that were in transit when the link went down
    fn messages_failed_sending(&self, messages: Vec<Message>, transport: &TransportHandle);

    /// The transport needs some other path to reach its peer
    fn need_transport(&self, _message: Message, _transport: &TransportHandle) {}
}

/// A way of carrying messages, owned by one endpoint
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Shared state machine embedded in every transport
    fn core(&self) -> &TransportCore;

    /// Whether this transport can open outgoing links
    fn can_connect(&self) -> bool;

    /// Whether this transport can accept incoming links
    fn can_listen(&self) -> bool {
        false
    }

    /// Object transports carry in-process attachments without serializing
    fn is_object_transport(&self) -> bool {
        false
    }

    /// Start opening the link. Completion is reported through state changes.
    fn connect(&self) -> Result<()>;

    /// Put one message on the link
    fn internal_send(&self, message: &Message, expect_more: bool) -> Result<()>;

    /// Close the link
    fn internal_disconnect(&self);

    /// Push out anything buffered by `internal_send(.., true)`
    fn flush(&self) {}

    /// Read transport options. Transports with their own settings should
    /// call `self.core().configure(config)` as well.
    fn configure(&self, config: &Configuration) {
        self.core().configure(config);
    }

    /// Options a remote client needs to reach this transport
    fn client_configuration(&self, _hostname: Option<&str>) -> Configuration {
        Configuration::new()
    }

    /// Hand over a message that arrived for this transport by another path
    fn receive_transported(&self, message: Message) {
        warn!(
            "[{}] transported message lost, transport does not accept them: {}",
            self.name(),
            message
        );
    }

    fn id(&self) -> TransportId {
        self.core().id()
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn state(&self) -> TransportState {
        self.core().state()
    }

    fn is_available(&self) -> bool {
        self.state() == TransportState::Available
    }

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    fn priority(&self) -> i32 {
        self.core().priority()
    }

    fn set_priority(&self, priority: i32) {
        self.core().set_priority(priority);
    }

    fn is_enabled(&self) -> bool {
        self.core().is_enabled()
    }

    fn enable(&self) {
        self.core().set_enabled(true);
    }

    /// Disable and take the link down
    fn disable(&self) {
        self.core().set_enabled(false);
        self.disconnect();
    }

    fn set_authentication(&self, auth: Arc<dyn Authentication>) {
        self.core().set_authentication(auth);
    }

    fn format(&self) -> Format {
        self.core().format()
    }

    fn set_format(&self, format: Format) {
        self.core().set_format(format);
    }

    fn set_delegate(&self, delegate: Weak<dyn TransportDelegate>) {
        self.core().set_delegate(delegate);
    }

    /// Send an endpoint message. Only legal in CONNECTED or AVAILABLE.
    fn send(&self, message: &Message, expect_more: bool) -> Result<()> {
        self.core().send(message, expect_more)
    }

    /// Send control traffic that bypasses the endpoint queues
    fn send_transport_specific(&self, message: Message) -> Result<()> {
        self.core().send_transport_specific(message)
    }

    fn disconnect(&self) {
        self.core().disconnect();
    }

    fn force_error(&self) {
        self.core().force_error();
    }

    fn last_alive(&self) -> Option<Instant> {
        self.core().last_alive()
    }

    /// True when traffic was seen within `within`. Otherwise, when `check`
    /// is set, probes with PING and waits up to `timeout` for the PONG.
    async fn is_alive(&self, within: Duration, check: bool, timeout: Duration) -> bool {
        self.core().is_alive(within, check, timeout).await
    }
}

/// Receives transports accepted by a listener
pub trait ListenerDelegate: Send + Sync {
    /// A new server-side transport. It is not yet started; set its delegate
    /// before returning.
    fn incoming_transport(&self, transport: TransportHandle);
}

/// A transport that accepts incoming links
pub trait ListenerTransport: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn configure(&self, config: &Configuration);

    /// Start accepting. Binding happens before this returns.
    fn listen(&self, delegate: Weak<dyn ListenerDelegate>) -> Result<()>;

    /// Options a client needs to reach this listener
    fn client_configuration(&self, hostname: Option<&str>) -> Configuration;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Stop accepting. Already accepted transports are unaffected.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(TransportState::Available.is_connected());
        assert!(TransportState::Unavailable.is_connected());
        assert!(!TransportState::Connecting.is_connected());
        assert!(TransportState::Error.is_closed());
        assert!(!TransportState::Disconnecting.is_closed());
        assert_eq!(TransportState::Available.to_string(), "AVAILABLE");
    }
}
