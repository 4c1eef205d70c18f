//! Channels
//!
//! A channel is one numbered stream inside a session. On the way out it
//! assigns message ids, cuts large payloads into fragments and keeps the
//! bytes in flight below its window. On the way in it restores id order
//! through a [`ReorderBuffer`] and joins fragments back together.
//!
//! Message ids are handed out only once the whole message, every fragment
//! of it, has been admitted to the queue.
//!
//! Lock order: `send_lock` before `outgoing`. The endpoint's scheduler lock
//! is always taken before any channel lock.

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, trace, warn};
use trap_core::{compression, Message, Operation, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_ID, HEADER_SIZE};
use trap_transport::TransportHandle;

use crate::buffer::{MessageBuffer, Received, ReorderBuffer};
use crate::error::{Result, TrapError};
use crate::queue::{run_cost, MessageQueue, QueueError};
use crate::scheduler::Task;

/// Window of a new channel, in chunks
const DEFAULT_WINDOW_CHUNKS: usize = 8;

/// The side of the endpoint a channel talks to
pub trait ChannelHost: Send + Sync {
    /// Upper bound for the chunk size of every channel
    fn max_chunk_size(&self) -> usize;

    /// There is something to send
    fn kick_sending(&self);

    /// A channel priority changed; the send schedule must be rebuilt
    fn schedule_changed(&self);

    /// Hand a complete message to the application
    fn deliver(&self, message: Message, transport: Option<TransportHandle>);

    /// The receive side of `channel` cannot continue
    fn receive_failed(&self, channel: u8, error: TrapError);

    /// Messages a sender gave up on because the channel was drained
    fn send_abandoned(&self, messages: Vec<Message>);

    fn spawn(&self, task: Task);
}

/// Bytes a message costs against the window. Auth data is left out: the
/// transport adds it after the message leaves the channel.
pub(crate) fn wire_cost(message: &Message) -> usize {
    message
        .length()
        .saturating_sub(message.auth_data().map_or(0, str::len))
}

struct Outgoing {
    queue: Box<dyn MessageQueue>,
    failed: Vec<Message>,
    bytes_in_flight: usize,
    max_in_flight: usize,
    chunk_size: usize,
    available: bool,
    next_id: u32,
    /// Bumped by every drain; a sender that waited across one gives up
    generation: u64,
}

impl Outgoing {
    fn next_message_id(&mut self, max: u32) -> u32 {
        let id = self.next_id;
        self.next_id = if id >= max { 1 } else { id + 1 };
        id
    }

    fn refresh(&mut self) {
        self.available = !self.queue.is_empty() && self.bytes_in_flight < self.max_in_flight;
    }
}

struct Incoming {
    buffer: Box<dyn MessageBuffer>,
    running: bool,
}

#[derive(Default)]
struct Assembly {
    data: BytesMut,
    receiving: bool,
}

pub struct Channel {
    id: u8,
    me: Weak<Channel>,
    host: Weak<dyn ChannelHost>,
    max_message_id: u32,
    send_lock: Mutex<()>,
    outgoing: Mutex<Outgoing>,
    space: Condvar,
    priority: AtomicI32,
    streaming: AtomicBool,
    incoming: Mutex<Incoming>,
    assembly: Mutex<Assembly>,
}

impl Channel {
    pub fn new(id: u8, host: Weak<dyn ChannelHost>, queue: Box<dyn MessageQueue>) -> Arc<Self> {
        let channel = Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            host,
            max_message_id: DEFAULT_MAX_MESSAGE_ID,
            send_lock: Mutex::new(()),
            outgoing: Mutex::new(Outgoing {
                queue,
                failed: Vec::new(),
                bytes_in_flight: 0,
                max_in_flight: 0,
                chunk_size: DEFAULT_CHUNK_SIZE,
                available: false,
                next_id: 1,
                generation: 0,
            }),
            space: Condvar::new(),
            priority: AtomicI32::new(if id == 0 { i32::MAX } else { 0 }),
            streaming: AtomicBool::new(false),
            incoming: Mutex::new(Incoming {
                buffer: Box::new(ReorderBuffer::default()),
                running: false,
            }),
            assembly: Mutex::new(Assembly::default()),
        });

        let chunk = channel.max_chunk().min(DEFAULT_CHUNK_SIZE);
        channel.set_chunk_size(chunk as i32);
        {
            let mut out = channel.outgoing.lock();
            out.max_in_flight = out.chunk_size.saturating_mul(DEFAULT_WINDOW_CHUNKS);
        }
        channel
    }

    fn host(&self) -> Option<Arc<dyn ChannelHost>> {
        self.host.upgrade()
    }

    fn max_chunk(&self) -> usize {
        self.host()
            .map_or(DEFAULT_CHUNK_SIZE, |host| host.max_chunk_size())
    }

    fn kick(&self) {
        if let Some(host) = self.host() {
            host.kick_sending();
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Higher runs first. Channel 0 always keeps the top priority.
    pub fn set_priority(&self, priority: i32) {
        if self.id == 0 {
            warn!("channel 0 priority is fixed");
            return;
        }
        if self.priority.swap(priority, Ordering::Relaxed) != priority {
            if let Some(host) = self.host() {
                host.schedule_changed();
            }
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }

    /// In streaming mode every fragment is delivered as soon as it arrives
    pub fn set_streaming_mode(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Relaxed);
    }

    pub fn chunk_size(&self) -> usize {
        self.outgoing.lock().chunk_size
    }

    /// Largest fragment payload. Sizes above the header size have the header
    /// taken off; zero or less means no limit besides the endpoint's.
    pub fn set_chunk_size(&self, bytes: i32) {
        let mut size = if bytes <= 0 { i32::MAX as usize } else { bytes as usize };
        if size > HEADER_SIZE {
            size -= HEADER_SIZE;
        }
        size = size.min(self.max_chunk()).max(1);

        let mut out = self.outgoing.lock();
        out.chunk_size = size;
        if out.max_in_flight < size.saturating_add(HEADER_SIZE) {
            out.max_in_flight = size.saturating_add(HEADER_SIZE);
        }
    }

    pub fn in_flight_bytes(&self) -> usize {
        self.outgoing.lock().max_in_flight
    }

    /// Set the window. It must hold at least one full fragment.
    pub fn set_in_flight_bytes(&self, bytes: usize) -> Result<()> {
        let mut out = self.outgoing.lock();
        let minimum = out.chunk_size.saturating_add(HEADER_SIZE);
        if bytes < minimum {
            return Err(TrapError::InvalidArgument(format!(
                "in-flight window {} is below chunk size plus header ({})",
                bytes, minimum
            )));
        }
        out.max_in_flight = bytes;
        out.refresh();
        Ok(())
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.outgoing.lock().bytes_in_flight
    }

    /// Replace the outgoing queue, moving queued messages over
    pub fn set_queue(&self, mut queue: Box<dyn MessageQueue>) -> Result<()> {
        let mut out = self.outgoing.lock();
        let queued = out.queue.drain();
        let mut rest = queued.into_iter();
        while let Some(message) = rest.next() {
            if let Err(QueueError::Full(message)) = queue.put(message) {
                // Put everything back where it was
                let mut restore = queue.drain();
                restore.push(message);
                restore.extend(rest);
                for m in restore {
                    let _ = out.queue.put(m);
                }
                return Err(TrapError::QueueFull);
            }
        }
        out.queue = queue;
        out.refresh();
        drop(out);
        self.space.notify_all();
        Ok(())
    }

    pub fn set_blocking_timeout(&self, timeout: Option<Duration>) {
        self.outgoing.lock().queue.set_blocking_timeout(timeout);
    }

    /// Messages waiting to be sent
    pub fn queued(&self) -> usize {
        self.outgoing.lock().queue.len()
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Queue `message`, fragmenting it when its wire payload exceeds the
    /// chunk size. Blocking queues make this wait for space. A refused
    /// message uses up no ids, so later messages still arrive.
    pub fn send(&self, mut message: Message) -> Result<()> {
        let _serial = self.send_lock.lock();

        message.set_channel(self.id);
        let chunk = self.outgoing.lock().chunk_size;

        let wire = message.compressed_payload()?;
        if wire.len() <= chunk || message.object().is_some() {
            return self.enqueue(vec![message], None);
        }

        let last = (wire.len() - 1) / chunk;
        trace!(
            "channel {} splitting a {} byte message into {} fragments",
            self.id,
            wire.len(),
            last + 1
        );

        let run = (0..wire.len())
            .step_by(chunk)
            .enumerate()
            .map(|(index, start)| {
                let op = match index {
                    0 => Operation::FragmentStart,
                    i if i == last => Operation::FragmentEnd,
                    _ => Operation::Message,
                };
                // Only the first fragment keeps an id picked by the caller
                let id = if index == 0 { message.message_id() } else { 0 };
                Message::new(op)
                    .with_message_id(id)
                    .with_channel(self.id)
                    .with_format(message.format())
                    .with_compressed(message.is_compressed())
                    .with_payload(wire.slice(start..(start + chunk).min(wire.len())))
            })
            .collect();
        self.enqueue(run, Some(message))
    }

    /// Admit `run` as a unit, then number it. `whole` is what gets reported
    /// if the channel is drained while waiting; the run itself otherwise.
    fn enqueue(&self, mut run: Vec<Message>, whole: Option<Message>) -> Result<()> {
        let (count, bytes) = run_cost(&run);
        {
            let mut out = self.outgoing.lock();
            let generation = out.generation;
            let deadline = out.queue.blocking_timeout().map(|t| Instant::now() + t);

            while !out.queue.has_room(count, bytes) {
                if !out.queue.is_blocking() || !self.wait_for_space(&mut out, deadline) {
                    return Err(TrapError::QueueFull);
                }
                if out.generation != generation {
                    drop(out);
                    debug!("channel {} drained while a sender waited", self.id);
                    if let Some(host) = self.host() {
                        host.send_abandoned(whole.map_or(run, |m| vec![m]));
                    }
                    return Err(TrapError::ChannelClosed);
                }
            }

            let first_id = out.next_id;
            for message in run.iter_mut() {
                if message.message_id() == 0 {
                    message.set_message_id(out.next_message_id(self.max_message_id));
                }
            }
            if out.queue.put_run(run).is_err() {
                out.next_id = first_id;
                return Err(TrapError::QueueFull);
            }

            if out.bytes_in_flight < out.max_in_flight {
                out.available = true;
            }
        }
        self.kick();
        Ok(())
    }

    /// Wait until something leaves the queue. False when the deadline passed
    /// or when waiting would stall the runtime that has to drain the queue.
    fn wait_for_space(&self, out: &mut MutexGuard<'_, Outgoing>, deadline: Option<Instant>) -> bool {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return false;
        }
        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Ok(RuntimeFlavor::CurrentThread) => {
                warn!(
                    "channel {} queue is full and a current-thread runtime cannot drain it while we wait",
                    self.id
                );
                return false;
            }
            Ok(_) => tokio::task::block_in_place(|| self.park(out, deadline)),
            Err(_) => self.park(out, deadline),
        }
        true
    }

    fn park(&self, out: &mut MutexGuard<'_, Outgoing>, deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => {
                self.space.wait_until(out, deadline);
            }
            None => self.space.wait(out),
        }
    }

    /// Whether the sending loop may pop from this channel now
    pub fn is_available(&self) -> bool {
        self.outgoing.lock().available
    }

    /// Next message the sending loop would get
    pub fn peek(&self) -> Option<Message> {
        let out = self.outgoing.lock();
        if !out.available {
            return None;
        }
        out.queue.peek().cloned()
    }

    /// Take the next message and charge it to the window
    pub fn pop(&self) -> Option<Message> {
        let message = {
            let mut out = self.outgoing.lock();
            if !out.available {
                return None;
            }
            let Some(message) = out.queue.pop() else {
                out.available = false;
                return None;
            };
            out.bytes_in_flight += wire_cost(&message);
            out.refresh();
            message
        };
        self.space.notify_all();
        Some(message)
    }

    /// A message popped from this channel reached the other side
    pub fn message_sent(&self, message: &Message) {
        let kick = {
            let mut out = self.outgoing.lock();
            out.bytes_in_flight = out.bytes_in_flight.saturating_sub(wire_cost(message));
            if out.bytes_in_flight < out.max_in_flight && !out.queue.is_empty() {
                out.available = true;
                true
            } else {
                false
            }
        };
        if kick {
            self.kick();
        }
    }

    /// File a message a transport failed to deliver. Takes effect with the
    /// next [`Channel::rebuild_queue`].
    pub fn add_failed_message(&self, message: Message) {
        self.outgoing.lock().failed.push(message);
    }

    /// Merge failed messages back into the queue in id order, dropping
    /// duplicate ids. Returns the messages that no longer fit.
    pub fn rebuild_queue(&self) -> Vec<Message> {
        let (lost, kick) = {
            let mut out = self.outgoing.lock();
            let mut failed = std::mem::take(&mut out.failed);
            if failed.is_empty() {
                return Vec::new();
            }

            for message in &failed {
                out.bytes_in_flight = out.bytes_in_flight.saturating_sub(wire_cost(message));
            }
            failed.retain(|m| m.message_id() != 0);

            // Stable sort: a failed copy stays ahead of a queued one
            let mut merged = failed;
            merged.extend(out.queue.drain());
            merged.sort_by_key(Message::message_id);
            merged.dedup_by_key(|m| m.message_id());

            let mut fresh = out.queue.create_new();
            let mut lost = Vec::new();
            for message in merged {
                if let Err(QueueError::Full(message)) = fresh.put(message) {
                    lost.push(message);
                }
            }

            debug!(
                "channel {} requeued {} messages, {} lost",
                self.id,
                fresh.len(),
                lost.len()
            );

            out.queue = fresh;
            out.refresh();
            (lost, out.available)
        };

        self.space.notify_all();
        if kick {
            self.kick();
        }
        lost
    }

    /// Remove every queued and failed message
    pub fn drain(&self) -> Vec<Message> {
        let drained = {
            let mut out = self.outgoing.lock();
            let mut drained = std::mem::take(&mut out.failed);
            drained.extend(out.queue.drain());
            out.bytes_in_flight = 0;
            out.available = false;
            out.generation += 1;
            drained
        };
        self.space.notify_all();
        drained
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    /// Buffer an incoming message and make sure one reader is draining
    pub fn receive_message(&self, message: Message, transport: Option<TransportHandle>) {
        let start = {
            let mut incoming = self.incoming.lock();
            if let Err(e) = incoming.buffer.put(message, transport) {
                warn!("channel {} dropped incoming message: {}", self.id, e);
            }
            if incoming.running || incoming.buffer.available() == 0 {
                false
            } else {
                incoming.running = true;
                true
            }
        };

        if !start {
            return;
        }

        let (Some(host), Some(me)) = (self.host(), self.me.upgrade()) else {
            self.incoming.lock().running = false;
            return;
        };
        host.spawn(Box::pin(async move { me.drain_incoming() }));
    }

    fn drain_incoming(&self) {
        loop {
            let next = {
                let mut incoming = self.incoming.lock();
                match incoming.buffer.fetch() {
                    Some(next) => next,
                    None => {
                        incoming.running = false;
                        return;
                    }
                }
            };
            self.process(next);
        }
    }

    fn process(&self, (mut message, transport): Received) {
        let Some(host) = self.host() else {
            return;
        };

        if !self.is_streaming() {
            let mut assembly = self.assembly.lock();

            if assembly.receiving {
                match message.op() {
                    Operation::FragmentEnd => {
                        assembly.receiving = false;
                        assembly.data.extend_from_slice(message.payload());
                    }
                    Operation::Message => {
                        assembly.data.extend_from_slice(message.payload());
                        return;
                    }
                    Operation::FragmentStart => {
                        warn!(
                            "channel {} dropped an unfinished fragment run of {} bytes",
                            self.id,
                            assembly.data.len()
                        );
                        assembly.data.clear();
                        assembly.data.extend_from_slice(message.payload());
                        return;
                    }
                    other => {
                        warn!("channel {} dropped {} inside a fragment run", self.id, other);
                        return;
                    }
                }

                let data = assembly.data.split().freeze();
                drop(assembly);

                let data = if message.is_compressed() {
                    match compression::inflate(&data) {
                        Ok(data) => data,
                        Err(e) => {
                            host.receive_failed(self.id, e.into());
                            return;
                        }
                    }
                } else {
                    data
                };

                message.set_op(Operation::Message);
                message.set_compressed(false);
                message.set_payload(data);
            } else if message.op() == Operation::FragmentStart {
                assembly.receiving = true;
                assembly.data.clear();
                assembly.data.extend_from_slice(message.payload());
                return;
            } else if message.op() == Operation::FragmentEnd {
                warn!(
                    "channel {} dropped fragment end {} with no run in progress",
                    self.id,
                    message.message_id()
                );
                return;
            }
        }

        host.deliver(message, transport);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("priority", &self.priority())
            .finish()
    }
}
