//! Protocol message model
//!
//! A [`Message`] is one protocol frame: operation, message id, channel,
//! compression flag, optional authentication blob and payload. The payload
//! is always held uncompressed; when the compressed flag is set the deflated
//! form is computed once and cached, since flow control needs the wire
//! length of every queued message.

use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::compression;
use crate::{Error, Result, HEADER_SIZE, MAX_AUTH_DATA_LEN};

/// In-process object carried by object-capable transports
pub type ObjectPayload = Arc<dyn Any + Send + Sync>;

/// Frame operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    Open = 1,
    Opened = 2,
    Close = 3,
    End = 4,
    Challenge = 5,
    Error = 6,
    Message = 8,
    Ack = 9,
    FragmentStart = 10,
    FragmentEnd = 11,
    Ok = 16,
    Ping = 17,
    Pong = 18,
    Transport = 19,
}

impl Operation {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => Operation::Open,
            2 => Operation::Opened,
            3 => Operation::Close,
            4 => Operation::End,
            5 => Operation::Challenge,
            6 => Operation::Error,
            8 => Operation::Message,
            9 => Operation::Ack,
            10 => Operation::FragmentStart,
            11 => Operation::FragmentEnd,
            16 => Operation::Ok,
            17 => Operation::Ping,
            18 => Operation::Pong,
            19 => Operation::Transport,
            other => return Err(Error::UnknownOperation(other)),
        })
    }

    /// Operations that carry application data through a channel
    pub fn is_data(self) -> bool {
        matches!(
            self,
            Operation::Message | Operation::FragmentStart | Operation::FragmentEnd
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Open => "OPEN",
            Operation::Opened => "OPENED",
            Operation::Close => "CLOSE",
            Operation::End => "END",
            Operation::Challenge => "CHALLENGE",
            Operation::Error => "ERROR",
            Operation::Message => "MESSAGE",
            Operation::Ack => "ACK",
            Operation::FragmentStart => "FRAGMENT_START",
            Operation::FragmentEnd => "FRAGMENT_END",
            Operation::Ok => "OK",
            Operation::Ping => "PING",
            Operation::Pong => "PONG",
            Operation::Transport => "TRANSPORT",
        };
        f.write_str(name)
    }
}

/// Wire encoding of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// 16-byte binary header, channels and compression supported
    #[default]
    Regular,
    /// Every header byte keeps its top bit clear; channel 0 only, no compression
    SevenBit,
}

/// A single protocol frame
#[derive(Clone)]
pub struct Message {
    op: Operation,
    message_id: u32,
    channel: u8,
    compressed: bool,
    format: Format,
    auth_data: Option<String>,
    payload: Bytes,
    object: Option<ObjectPayload>,
    deflated: Arc<OnceLock<Bytes>>,
}

impl Message {
    /// Create a message with an empty payload
    pub fn new(op: Operation) -> Self {
        Self {
            op,
            message_id: 0,
            channel: 0,
            compressed: false,
            format: Format::Regular,
            auth_data: None,
            payload: Bytes::new(),
            object: None,
            deflated: Arc::new(OnceLock::new()),
        }
    }

    /// Create a MESSAGE carrying `payload`
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self::new(Operation::Message).with_payload(payload)
    }

    pub fn with_op(mut self, op: Operation) -> Self {
        self.op = op;
        self
    }

    pub fn with_message_id(mut self, id: u32) -> Self {
        self.message_id = id;
        self
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.set_compressed(compressed);
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.set_payload(payload);
        self
    }

    pub fn with_object(mut self, object: ObjectPayload) -> Self {
        self.object = Some(object);
        self
    }

    pub fn with_auth_data(mut self, auth: Option<String>) -> Result<Self> {
        self.set_auth_data(auth)?;
        Ok(self)
    }

    pub fn op(&self) -> Operation {
        self.op
    }

    pub fn set_op(&mut self, op: Operation) {
        self.op = op;
    }

    /// Message id; 0 means unassigned
    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    pub fn set_message_id(&mut self, id: u32) {
        self.message_id = id;
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn set_compressed(&mut self, compressed: bool) {
        if self.compressed != compressed {
            self.compressed = compressed;
            self.deflated = Arc::new(OnceLock::new());
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    pub fn auth_data(&self) -> Option<&str> {
        self.auth_data.as_deref()
    }

    /// Set the authentication blob. Empty strings count as absent.
    pub fn set_auth_data(&mut self, auth: Option<String>) -> Result<()> {
        match auth {
            Some(a) if a.len() > MAX_AUTH_DATA_LEN => Err(Error::AuthDataTooLarge(a.len())),
            Some(a) if a.is_empty() => {
                self.auth_data = None;
                Ok(())
            }
            other => {
                self.auth_data = other;
                Ok(())
            }
        }
    }

    /// Uncompressed payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
        self.deflated = Arc::new(OnceLock::new());
    }

    pub fn object(&self) -> Option<&ObjectPayload> {
        self.object.as_ref()
    }

    pub fn take_object(&mut self) -> Option<ObjectPayload> {
        self.object.take()
    }

    /// Payload as it appears on the wire: deflated when the compressed flag
    /// is set, otherwise the payload itself.
    pub fn compressed_payload(&self) -> Result<Bytes> {
        if !self.compressed {
            return Ok(self.payload.clone());
        }
        if let Some(cached) = self.deflated.get() {
            return Ok(cached.clone());
        }
        let deflated = compression::deflate(&self.payload)?;
        Ok(self.deflated.get_or_init(|| deflated).clone())
    }

    /// Record the wire form of a payload that arrived compressed, so that
    /// `length()` reflects what was transmitted without deflating again.
    pub(crate) fn cache_wire_payload(&mut self, wire: Bytes) {
        let cache = OnceLock::new();
        let _ = cache.set(wire);
        self.deflated = Arc::new(cache);
    }

    /// Bytes this message occupies on the wire, used for flow-control accounting
    pub fn length(&self) -> usize {
        let auth = self.auth_data.as_ref().map_or(0, |a| a.len());
        let payload = self
            .compressed_payload()
            .map(|p| p.len())
            .unwrap_or(self.payload.len());
        HEADER_SIZE + auth + payload
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op
            && self.message_id == other.message_id
            && self.channel == other.channel
            && self.compressed == other.compressed
            && self.format == other.format
            && self.auth_data == other.auth_data
            && self.payload == other.payload
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("op", &self.op)
            .field("id", &self.message_id)
            .field("channel", &self.channel)
            .field("compressed", &self.compressed)
            .field("format", &self.format)
            .field("auth", &self.auth_data.is_some())
            .field("len", &self.payload.len())
            .field("object", &self.object.is_some())
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/C{}/{}", self.op, self.channel, self.message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_codes() {
        for code in 0u8..64 {
            if let Ok(op) = Operation::from_code(code) {
                assert_eq!(op.code(), code);
            }
        }
        assert!(Operation::from_code(7).is_err());
        assert!(Operation::from_code(12).is_err());
        assert!(Operation::from_code(20).is_err());
    }

    #[test]
    fn test_empty_auth_is_none() {
        let msg = Message::new(Operation::Open)
            .with_auth_data(Some(String::new()))
            .unwrap();
        assert_eq!(msg.auth_data(), None);
    }

    #[test]
    fn test_auth_too_large() {
        let mut msg = Message::new(Operation::Open);
        let err = msg.set_auth_data(Some("a".repeat(MAX_AUTH_DATA_LEN + 1)));
        assert!(matches!(err, Err(Error::AuthDataTooLarge(65536))));
        assert!(msg.set_auth_data(Some("a".repeat(MAX_AUTH_DATA_LEN))).is_ok());
    }

    #[test]
    fn test_length_uses_compressed_payload() {
        let payload = vec![b'x'; 4096];
        let plain = Message::data(payload.clone());
        let compressed = Message::data(payload).with_compressed(true);

        assert_eq!(plain.length(), HEADER_SIZE + 4096);
        assert!(compressed.length() < plain.length());
        assert_eq!(
            compressed.length(),
            HEADER_SIZE + compressed.compressed_payload().unwrap().len()
        );
    }

    #[test]
    fn test_payload_change_invalidates_cache() {
        let mut msg = Message::data(vec![0u8; 1000]).with_compressed(true);
        let first = msg.compressed_payload().unwrap();
        msg.set_payload(vec![1u8; 10]);
        let second = msg.compressed_payload().unwrap();
        assert_ne!(first, second);
        assert_eq!(compression::inflate(&second).unwrap().as_ref(), &[1u8; 10]);
    }
}
