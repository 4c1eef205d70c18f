//! Incoming reorder buffer
//!
//! Messages of one channel may arrive out of order when several transports
//! are active at once. The buffer releases them strictly by message id:
//! `read` is the next id to hand out, `write` the first id not yet received
//! contiguously after it. Ids wrap from `max` back to `min`; positions are
//! kept as virtual ids above `max` until `read` itself wraps.

use std::collections::BTreeMap;
use trap_core::{Message, DEFAULT_MAX_MESSAGE_ID};
use trap_transport::TransportHandle;

use crate::error::{Result, TrapError};

/// How far ahead of the read position an id may be
pub const DEFAULT_WINDOW: u64 = 65535;

/// A received message and the transport it arrived on
pub type Received = (Message, Option<TransportHandle>);

pub trait MessageBuffer: Send {
    /// Store a message. Duplicates are dropped silently.
    fn put(&mut self, message: Message, transport: Option<TransportHandle>) -> Result<()>;

    /// Next message in id order, if it has arrived
    fn fetch(&mut self) -> Option<Received>;

    /// Messages ready to fetch
    fn available(&self) -> usize;
}

pub struct ReorderBuffer {
    slots: BTreeMap<u64, Received>,
    min: u64,
    max: u64,
    window: u64,
    read: u64,
    write: u64,
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new(1, DEFAULT_MAX_MESSAGE_ID, DEFAULT_WINDOW)
    }
}

impl ReorderBuffer {
    pub fn new(min: u32, max: u32, window: u64) -> Self {
        Self {
            slots: BTreeMap::new(),
            min: min as u64,
            max: max as u64,
            window,
            read: min as u64,
            write: min as u64,
        }
    }

    fn range(&self) -> u64 {
        self.max - self.min + 1
    }

    fn unwrap_positions(&mut self) {
        let range = self.range();
        self.read -= range;
        self.write -= range;
        let slots = std::mem::take(&mut self.slots);
        self.slots = slots.into_iter().map(|(k, v)| (k - range, v)).collect();
    }
}

impl MessageBuffer for ReorderBuffer {
    fn put(&mut self, message: Message, transport: Option<TransportHandle>) -> Result<()> {
        let raw = message.message_id();
        let mut id = raw as u64;

        if id < self.min || id > self.max {
            return Err(TrapError::InvalidMessageId(raw));
        }

        if id < self.read {
            if self.read - id > self.range() / 2 {
                id += self.range();
            } else {
                return Ok(());
            }
        }

        if id > self.read + self.window {
            return Err(TrapError::BufferOverflow(raw));
        }

        if id < self.write {
            return Ok(());
        }

        self.slots.insert(id, (message, transport));
        while self.slots.contains_key(&self.write) {
            self.write += 1;
        }
        Ok(())
    }

    fn fetch(&mut self) -> Option<Received> {
        if self.read >= self.write {
            return None;
        }
        let entry = self.slots.remove(&self.read)?;
        self.read += 1;
        if self.read > self.max {
            self.unwrap_positions();
        }
        Some(entry)
    }

    fn available(&self) -> usize {
        (self.write - self.read) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: u32) -> Message {
        Message::data(id.to_be_bytes().to_vec()).with_message_id(id)
    }

    fn drain(buffer: &mut ReorderBuffer) -> Vec<u32> {
        std::iter::from_fn(|| buffer.fetch())
            .map(|(m, _)| m.message_id())
            .collect()
    }

    #[test]
    fn test_in_order() {
        let mut buffer = ReorderBuffer::default();
        for id in 1..=3 {
            buffer.put(msg(id), None).unwrap();
        }
        assert_eq!(buffer.available(), 3);
        assert_eq!(drain(&mut buffer), vec![1, 2, 3]);
        assert_eq!(buffer.available(), 0);
    }

    #[test]
    fn test_gap_blocks_release() {
        let mut buffer = ReorderBuffer::default();
        buffer.put(msg(2), None).unwrap();
        buffer.put(msg(3), None).unwrap();
        assert!(buffer.fetch().is_none());

        buffer.put(msg(1), None).unwrap();
        assert_eq!(drain(&mut buffer), vec![1, 2, 3]);
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut buffer = ReorderBuffer::default();
        buffer.put(msg(1), None).unwrap();
        buffer.put(msg(1), None).unwrap();
        assert_eq!(drain(&mut buffer), vec![1]);

        // Behind the read position
        buffer.put(msg(1), None).unwrap();
        assert!(buffer.fetch().is_none());
    }

    #[test]
    fn test_invalid_and_overflowing_ids() {
        let mut buffer = ReorderBuffer::new(1, 100, 10);
        assert!(matches!(
            buffer.put(msg(0), None),
            Err(TrapError::InvalidMessageId(0))
        ));
        assert!(matches!(
            buffer.put(msg(101), None),
            Err(TrapError::InvalidMessageId(101))
        ));
        assert!(matches!(
            buffer.put(msg(12), None),
            Err(TrapError::BufferOverflow(12))
        ));
        buffer.put(msg(11), None).unwrap();
    }

    #[test]
    fn test_wraparound() {
        let mut buffer = ReorderBuffer::new(1, 10, 5);
        for id in 1..=8 {
            buffer.put(msg(id), None).unwrap();
        }
        assert_eq!(drain(&mut buffer).len(), 8);

        // 9, 10 then wrapped 1, 2 arriving out of order
        buffer.put(msg(2), None).unwrap();
        buffer.put(msg(10), None).unwrap();
        buffer.put(msg(1), None).unwrap();
        assert!(buffer.fetch().is_none());
        buffer.put(msg(9), None).unwrap();

        assert_eq!(drain(&mut buffer), vec![9, 10, 1, 2]);

        buffer.put(msg(3), None).unwrap();
        assert_eq!(drain(&mut buffer), vec![3]);
    }
}
