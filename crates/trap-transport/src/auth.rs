//! Authentication hook
//!
//! Transports run every outgoing message through
//! [`Authentication::create_response`] and every incoming one through
//! [`Authentication::verify`]. A message that fails verification is answered
//! with CHALLENGE and dropped; the remote side remembers the challenge and
//! answers it on its following messages.

use trap_core::Message;

pub trait Authentication: Send + Sync {
    /// Auth data to attach to `message`, given the last challenge seen
    fn create_response(&self, challenge: Option<&Message>, message: &Message) -> Option<String>;

    /// Whether an incoming message is acceptable
    fn verify(&self, message: &Message) -> bool;

    /// Payload of the CHALLENGE sent when verification fails
    fn challenge(&self) -> Option<String>;
}

/// Accepts everything and adds nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuthentication;

impl Authentication for NullAuthentication {
    fn create_response(&self, _challenge: Option<&Message>, _message: &Message) -> Option<String> {
        None
    }

    fn verify(&self, _message: &Message) -> bool {
        true
    }

    fn challenge(&self) -> Option<String> {
        None
    }
}

/// Shared-secret authentication: every message carries the secret as auth
/// data once the peer has asked for it.
#[derive(Debug, Clone)]
pub struct SharedSecretAuthentication {
    secret: String,
}

impl SharedSecretAuthentication {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl Authentication for SharedSecretAuthentication {
    fn create_response(&self, challenge: Option<&Message>, _message: &Message) -> Option<String> {
        challenge.map(|_| self.secret.clone())
    }

    fn verify(&self, message: &Message) -> bool {
        message.auth_data() == Some(self.secret.as_str())
    }

    fn challenge(&self) -> Option<String> {
        Some("secret".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trap_core::Operation;

    #[test]
    fn test_null_authentication() {
        let auth = NullAuthentication;
        let msg = Message::new(Operation::Open);
        assert!(auth.verify(&msg));
        assert_eq!(auth.create_response(None, &msg), None);
    }

    #[test]
    fn test_shared_secret_answers_only_after_challenge() {
        let auth = SharedSecretAuthentication::new("s3cret");
        let msg = Message::new(Operation::Message);
        let challenge = Message::new(Operation::Challenge);

        assert_eq!(auth.create_response(None, &msg), None);
        assert_eq!(
            auth.create_response(Some(&challenge), &msg).as_deref(),
            Some("s3cret")
        );
        assert!(!auth.verify(&msg));

        let signed = msg.with_auth_data(Some("s3cret".into())).unwrap();
        assert!(auth.verify(&signed));
    }
}
