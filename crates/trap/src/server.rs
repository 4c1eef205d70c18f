//! Server session endpoint
//!
//! A listener creates one server endpoint per client session. It answers
//! OPEN with the session id, pushes a fresh client configuration when the
//! client's digest is stale, and sleeps when the client's last transport
//! drops. It never reconnects on its own: the client has to come back
//! before the reconnect timeout closes the session.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};
use trap_core::Message;
use trap_transport::{TransportHandle, TransportState};

use crate::endpoint::{EndpointInner, EndpointKind, Role};
use crate::error::Result;
use crate::handshake::{OpenBody, OpenedBody};
use crate::listener::ListenerInner;
use crate::state::EndpointState;

pub(crate) struct ServerRole {
    listener: Weak<ListenerInner>,
}

impl ServerRole {
    pub(crate) fn new(listener: Weak<ListenerInner>) -> Arc<Self> {
        Arc::new(Self { listener })
    }
}

#[async_trait]
impl Role for ServerRole {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Server
    }

    fn transport_state_changed(
        &self,
        endpoint: &Arc<EndpointInner>,
        new_state: TransportState,
        _old_state: TransportState,
        transport: &TransportHandle,
    ) {
        if !new_state.is_closed() || endpoint.state() != EndpointState::Open {
            return;
        }
        if endpoint.has_available() {
            return;
        }

        info!(
            "[{}] lost {}, waiting for the client to come back",
            endpoint.trap_id(),
            transport.name()
        );
        endpoint.set_state(EndpointState::Sleeping);
    }

    fn opened_reply(&self, endpoint: &Arc<EndpointInner>, open: &Message) -> Message {
        let body = OpenBody::parse(open.payload());
        endpoint.set_compression(body.compression.unwrap_or(false));

        let configuration = match (&body.config_hash, self.listener.upgrade()) {
            (Some(hash), Some(listener)) => {
                let current = listener.client_configuration(body.auto_hostname.as_deref());
                if current.is_empty() || current.digest() == *hash {
                    None
                } else {
                    debug!("[{}] client configuration is stale", endpoint.trap_id());
                    Some(current)
                }
            }
            _ => None,
        };

        OpenedBody {
            endpoint_id: Some(endpoint.trap_id()),
            configuration,
        }
        .to_message()
    }

    async fn reconnect(&self, endpoint: &Arc<EndpointInner>, _timeout: Duration) -> Result<()> {
        endpoint.set_state(EndpointState::Closed);
        Ok(())
    }

    fn reconnects_when_probing(&self) -> bool {
        false
    }

    fn endpoint_state_changed(
        &self,
        endpoint: &Arc<EndpointInner>,
        new_state: EndpointState,
        _old_state: EndpointState,
    ) {
        if matches!(new_state, EndpointState::Closed | EndpointState::Error) {
            if let Some(listener) = self.listener.upgrade() {
                listener.unregister(&endpoint.trap_id());
            }
        }
    }
}
