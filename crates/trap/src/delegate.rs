//! Application callbacks
//!
//! An application registers any subset of the callbacks; events for empty
//! slots are logged at debug level and dropped.
//!
//! ```ignore
//! let delegates = Delegates::new()
//!     .on_data(|data, channel, _endpoint| println!("{} bytes on {}", data.len(), channel))
//!     .on_close(|endpoint| println!("{} closed", endpoint.trap_id()));
//! endpoint.set_delegates(delegates, false);
//! ```

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use trap_core::ObjectPayload;

use crate::endpoint::Endpoint;
use crate::listener::ListenerEndpoint;
use crate::state::EndpointState;

pub type DataHandler = Arc<dyn Fn(Bytes, u8, &Endpoint) + Send + Sync>;
pub type ObjectHandler = Arc<dyn Fn(ObjectPayload, u8, &Endpoint) + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(&Endpoint) + Send + Sync>;
pub type StateHandler = Arc<dyn Fn(EndpointState, EndpointState, &Endpoint) + Send + Sync>;
pub type FailedHandler = Arc<dyn Fn(Vec<FailedPayload>, &Endpoint) + Send + Sync>;
pub type AcceptHandler = Arc<dyn Fn(Endpoint, &ListenerEndpoint) + Send + Sync>;

/// Payload of a message that will never be delivered
#[derive(Clone)]
pub enum FailedPayload {
    Data(Bytes),
    Object(ObjectPayload),
}

impl fmt::Debug for FailedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailedPayload::Data(data) => f.debug_tuple("Data").field(&data.len()).finish(),
            FailedPayload::Object(_) => f.write_str("Object(..)"),
        }
    }
}

/// One optional slot per callback
#[derive(Clone, Default)]
pub struct Delegates {
    pub(crate) data: Option<DataHandler>,
    pub(crate) object: Option<ObjectHandler>,
    pub(crate) open: Option<EventHandler>,
    pub(crate) close: Option<EventHandler>,
    pub(crate) error: Option<EventHandler>,
    pub(crate) sleep: Option<EventHandler>,
    pub(crate) wakeup: Option<EventHandler>,
    pub(crate) state_change: Option<StateHandler>,
    pub(crate) failed_sending: Option<FailedHandler>,
    pub(crate) accept: Option<AcceptHandler>,
}

impl Delegates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received on a channel
    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: Fn(Bytes, u8, &Endpoint) + Send + Sync + 'static,
    {
        self.data = Some(Arc::new(f));
        self
    }

    /// An in-process object received over an object transport
    pub fn on_object<F>(mut self, f: F) -> Self
    where
        F: Fn(ObjectPayload, u8, &Endpoint) + Send + Sync + 'static,
    {
        self.object = Some(Arc::new(f));
        self
    }

    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&Endpoint) + Send + Sync + 'static,
    {
        self.open = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&Endpoint) + Send + Sync + 'static,
    {
        self.close = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Endpoint) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn on_sleep<F>(mut self, f: F) -> Self
    where
        F: Fn(&Endpoint) + Send + Sync + 'static,
    {
        self.sleep = Some(Arc::new(f));
        self
    }

    pub fn on_wakeup<F>(mut self, f: F) -> Self
    where
        F: Fn(&Endpoint) + Send + Sync + 'static,
    {
        self.wakeup = Some(Arc::new(f));
        self
    }

    /// Every state change, as `(new, old)`
    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(EndpointState, EndpointState, &Endpoint) + Send + Sync + 'static,
    {
        self.state_change = Some(Arc::new(f));
        self
    }

    /// Queued messages that were given up on
    pub fn on_failed_sending<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<FailedPayload>, &Endpoint) + Send + Sync + 'static,
    {
        self.failed_sending = Some(Arc::new(f));
        self
    }

    /// A listener created a new server endpoint
    pub fn on_accept<F>(mut self, f: F) -> Self
    where
        F: Fn(Endpoint, &ListenerEndpoint) + Send + Sync + 'static,
    {
        self.accept = Some(Arc::new(f));
        self
    }

    /// Overwrite the slots `other` fills; keep the rest
    pub fn merge(&mut self, other: Delegates) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.data, other.data);
        take(&mut self.object, other.object);
        take(&mut self.open, other.open);
        take(&mut self.close, other.close);
        take(&mut self.error, other.error);
        take(&mut self.sleep, other.sleep);
        take(&mut self.wakeup, other.wakeup);
        take(&mut self.state_change, other.state_change);
        take(&mut self.failed_sending, other.failed_sending);
        take(&mut self.accept, other.accept);
    }
}

impl fmt::Debug for Delegates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = Vec::new();
        for (name, present) in [
            ("data", self.data.is_some()),
            ("object", self.object.is_some()),
            ("open", self.open.is_some()),
            ("close", self.close.is_some()),
            ("error", self.error.is_some()),
            ("sleep", self.sleep.is_some()),
            ("wakeup", self.wakeup.is_some()),
            ("state_change", self.state_change.is_some()),
            ("failed_sending", self.failed_sending.is_some()),
            ("accept", self.accept.is_some()),
        ] {
            if present {
                set.push(name);
            }
        }
        f.debug_struct("Delegates").field("set", &set).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_only_overwrites_supplied_slots() {
        let mut base = Delegates::new().on_open(|_| {}).on_close(|_| {});
        base.merge(Delegates::new().on_data(|_, _, _| {}));

        assert!(base.open.is_some());
        assert!(base.close.is_some());
        assert!(base.data.is_some());
        assert!(base.error.is_none());
    }

    #[test]
    fn test_debug_lists_set_slots() {
        let delegates = Delegates::new().on_sleep(|_| {}).on_wakeup(|_| {});
        assert_eq!(
            format!("{:?}", delegates),
            r#"Delegates { set: ["sleep", "wakeup"] }"#
        );
    }
}
