//! Endpoint lifecycle state
//!
//! ```text
//! CLOSED -> OPENING -> OPEN <-> SLEEPING
//!                       |          |
//!                       v          v
//!                    CLOSING --> CLOSED
//!
//! any non-terminal state -> ERROR
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointState {
    Closed,
    Opening,
    Open,
    Sleeping,
    Closing,
    Error,
}

impl EndpointState {
    /// Closed, closing or errored: nothing will be sent any more
    pub fn is_shut(self) -> bool {
        matches!(
            self,
            EndpointState::Closed | EndpointState::Closing | EndpointState::Error
        )
    }

    /// Whether application messages may be queued
    pub fn accepts_messages(self) -> bool {
        matches!(self, EndpointState::Open | EndpointState::Sleeping)
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointState::Closed => "CLOSED",
            EndpointState::Opening => "OPENING",
            EndpointState::Open => "OPEN",
            EndpointState::Sleeping => "SLEEPING",
            EndpointState::Closing => "CLOSING",
            EndpointState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(EndpointState::Closing.is_shut());
        assert!(!EndpointState::Sleeping.is_shut());
        assert!(EndpointState::Sleeping.accepts_messages());
        assert!(!EndpointState::Opening.accepts_messages());
        assert_eq!(EndpointState::Sleeping.to_string(), "SLEEPING");
    }
}
