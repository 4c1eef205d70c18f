//! Outgoing message queues
//!
//! Each channel owns one [`MessageQueue`]. The queue only stores messages
//! and enforces its bound; waiting for space is done by the channel, which
//! asks [`MessageQueue::is_blocking`] whether a full queue should make the
//! sender wait or fail.
//!
//! Admission is decided per run: a fragmented payload goes in whole or not
//! at all, so a refused send never leaves a gap in the message ids.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use trap_core::Message;

/// Default bound of the message-counting blocking queue
pub const DEFAULT_MESSAGE_CAPACITY: usize = 1000;

/// Default bound of the byte-counting queues
pub const DEFAULT_BYTE_CAPACITY: usize = i32::MAX as usize;

/// How long a sender waits on a full blocking queue unless told otherwise
pub const DEFAULT_BLOCKING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum QueueError {
    /// The queue is at its bound; the rejected message is handed back
    #[error("queue is full")]
    Full(Message),

    /// A run did not fit; all of it is handed back
    #[error("queue has no room for {} messages", .0.len())]
    RunFull(Vec<Message>),
}

/// Data messages in `run` and their wire bytes. Control messages are never
/// held back by a bound, so they cost nothing.
pub fn run_cost(run: &[Message]) -> (usize, usize) {
    run.iter()
        .filter(|m| m.op().is_data())
        .fold((0, 0), |(count, bytes), m| (count + 1, bytes + m.length()))
}

/// The four queue strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueType {
    /// Unbounded
    RegularMessage,
    /// Bounded by queued wire bytes, fails when full
    RegularByte,
    /// Bounded by message count, senders wait for space
    #[default]
    BlockingMessage,
    /// Bounded by queued wire bytes, senders wait for space
    BlockingByte,
}

impl QueueType {
    pub fn name(self) -> &'static str {
        match self {
            QueueType::RegularMessage => "REGULAR_MESSAGE_QUEUE",
            QueueType::RegularByte => "REGULAR_BYTE_QUEUE",
            QueueType::BlockingMessage => "BLOCKING_MESSAGE_QUEUE",
            QueueType::BlockingByte => "BLOCKING_BYTE_QUEUE",
        }
    }

    pub fn is_blocking(self) -> bool {
        matches!(self, QueueType::BlockingMessage | QueueType::BlockingByte)
    }

    pub fn counts_bytes(self) -> bool {
        matches!(self, QueueType::RegularByte | QueueType::BlockingByte)
    }

    fn default_capacity(self) -> usize {
        match self {
            QueueType::RegularMessage => usize::MAX,
            QueueType::BlockingMessage => DEFAULT_MESSAGE_CAPACITY,
            QueueType::RegularByte | QueueType::BlockingByte => DEFAULT_BYTE_CAPACITY,
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for QueueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "REGULAR_MESSAGE_QUEUE" => Ok(QueueType::RegularMessage),
            "REGULAR_BYTE_QUEUE" => Ok(QueueType::RegularByte),
            "BLOCKING_MESSAGE_QUEUE" => Ok(QueueType::BlockingMessage),
            "BLOCKING_BYTE_QUEUE" => Ok(QueueType::BlockingByte),
            other => Err(format!("unknown queue type: {}", other)),
        }
    }
}

/// FIFO of outgoing messages for one channel
pub trait MessageQueue: Send {
    /// Append `message`, or hand it back when the queue is at its bound
    fn put(&mut self, message: Message) -> Result<(), QueueError>;

    /// Append every message of `run` in order, or none of them
    fn put_run(&mut self, run: Vec<Message>) -> Result<(), QueueError>;

    /// Whether `messages` data messages of `bytes` wire bytes fit right now
    fn has_room(&self, messages: usize, bytes: usize) -> bool;

    fn peek(&self) -> Option<&Message>;

    fn pop(&mut self) -> Option<Message>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything
    fn drain(&mut self) -> Vec<Message>;

    fn queue_type(&self) -> QueueType;

    /// Whether a sender should wait for space instead of failing
    fn is_blocking(&self) -> bool;

    /// How long a sender waits for space; `None` waits indefinitely.
    /// Defaults to [`DEFAULT_BLOCKING_TIMEOUT`].
    fn blocking_timeout(&self) -> Option<Duration>;

    fn set_blocking_timeout(&mut self, timeout: Option<Duration>);

    /// Bound in messages or bytes, depending on the type
    fn capacity(&self) -> usize;

    fn resize(&mut self, capacity: usize);

    /// Empty queue of the same type and settings
    fn create_new(&self) -> Box<dyn MessageQueue>;
}

/// Builds the queue of every new channel
pub trait QueueFactory: Send + Sync {
    fn create(&self) -> Box<dyn MessageQueue>;
}

impl QueueFactory for QueueType {
    fn create(&self) -> Box<dyn MessageQueue> {
        Box::new(LinkedQueue::new(*self))
    }
}

/// `VecDeque` backed queue implementing all four strategies
#[derive(Debug)]
pub struct LinkedQueue {
    kind: QueueType,
    messages: VecDeque<Message>,
    bytes: usize,
    capacity: usize,
    blocking_timeout: Option<Duration>,
}

impl LinkedQueue {
    pub fn new(kind: QueueType) -> Self {
        Self::with_capacity(kind, kind.default_capacity())
    }

    pub fn with_capacity(kind: QueueType, capacity: usize) -> Self {
        Self {
            kind,
            messages: VecDeque::new(),
            bytes: 0,
            capacity,
            blocking_timeout: Some(DEFAULT_BLOCKING_TIMEOUT),
        }
    }

    /// Wire bytes currently queued
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn push(&mut self, message: Message) {
        if self.kind.counts_bytes() {
            self.bytes += message.length();
        }
        self.messages.push_back(message);
    }
}

impl MessageQueue for LinkedQueue {
    fn put(&mut self, message: Message) -> Result<(), QueueError> {
        let (count, bytes) = run_cost(std::slice::from_ref(&message));
        if !self.has_room(count, bytes) {
            return Err(QueueError::Full(message));
        }
        self.push(message);
        Ok(())
    }

    fn put_run(&mut self, run: Vec<Message>) -> Result<(), QueueError> {
        let (count, bytes) = run_cost(&run);
        if !self.has_room(count, bytes) {
            return Err(QueueError::RunFull(run));
        }
        for message in run {
            self.push(message);
        }
        Ok(())
    }

    fn has_room(&self, messages: usize, bytes: usize) -> bool {
        if messages == 0 {
            return true;
        }
        match self.kind {
            QueueType::RegularMessage => true,
            QueueType::BlockingMessage => {
                self.messages.len().saturating_add(messages) <= self.capacity
            }
            // An empty byte queue takes anything, or oversized runs could never go out
            QueueType::RegularByte | QueueType::BlockingByte => {
                self.messages.is_empty() || self.bytes.saturating_add(bytes) <= self.capacity
            }
        }
    }

    fn peek(&self) -> Option<&Message> {
        self.messages.front()
    }

    fn pop(&mut self) -> Option<Message> {
        let message = self.messages.pop_front()?;
        if self.kind.counts_bytes() {
            self.bytes = self.bytes.saturating_sub(message.length());
        }
        Some(message)
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn drain(&mut self) -> Vec<Message> {
        self.bytes = 0;
        self.messages.drain(..).collect()
    }

    fn queue_type(&self) -> QueueType {
        self.kind
    }

    fn is_blocking(&self) -> bool {
        self.kind.is_blocking()
    }

    fn blocking_timeout(&self) -> Option<Duration> {
        self.blocking_timeout
    }

    fn set_blocking_timeout(&mut self, timeout: Option<Duration>) {
        self.blocking_timeout = timeout;
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    fn create_new(&self) -> Box<dyn MessageQueue> {
        let mut queue = LinkedQueue::with_capacity(self.kind, self.capacity);
        queue.blocking_timeout = self.blocking_timeout;
        Box::new(queue)
    }
}
