//! Interleaving of channels on the way out
//!
//! Channels are grouped by priority, highest first. Inside a group the
//! scheduler takes one message per channel in turn. A group may send up to
//! its priority value in bytes before the next group gets a turn; `rewind`
//! returns to the top group once a pass is over.

use std::sync::Arc;
use trap_core::Message;

use crate::channel::{wire_cost, Channel};

struct PriorityGroup {
    priority: i32,
    channels: Vec<Arc<Channel>>,
    next: usize,
}

impl PriorityGroup {
    fn pop(&mut self) -> Option<Message> {
        let count = self.channels.len();
        for offset in 0..count {
            let index = (self.next + offset) % count;
            if let Some(message) = self.channels[index].pop() {
                self.next = (index + 1) % count;
                return Some(message);
            }
        }
        None
    }

    fn has_pending(&self) -> bool {
        self.channels.iter().any(|c| c.is_available())
    }
}

#[derive(Default)]
pub struct ChannelScheduler {
    groups: Vec<PriorityGroup>,
    index: usize,
    spent: i64,
}

impl ChannelScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Regroup `channels` by priority
    pub fn rebuild<I>(&mut self, channels: I)
    where
        I: IntoIterator<Item = Arc<Channel>>,
    {
        let mut channels: Vec<Arc<Channel>> = channels.into_iter().collect();
        channels.sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.id().cmp(&b.id())));

        self.groups.clear();
        for channel in channels {
            let priority = channel.priority();
            match self.groups.last_mut() {
                Some(group) if group.priority == priority => group.channels.push(channel),
                _ => self.groups.push(PriorityGroup {
                    priority,
                    channels: vec![channel],
                    next: 0,
                }),
            }
        }
        self.rewind();
    }

    /// Next message by priority, or `None` when no channel can send
    pub fn pop(&mut self) -> Option<Message> {
        for index in self.index..self.groups.len() {
            let Some(message) = self.groups[index].pop() else {
                continue;
            };

            if index != self.index {
                self.index = index;
                self.spent = 0;
            }

            self.spent += wire_cost(&message) as i64;
            if self.spent > self.groups[index].priority as i64 && index + 1 < self.groups.len() {
                self.index = index + 1;
                self.spent = 0;
            }
            return Some(message);
        }
        None
    }

    /// Whether any channel has something it may send
    pub fn has_pending(&self) -> bool {
        self.groups.iter().any(PriorityGroup::has_pending)
    }

    /// Start the next pass from the top group
    pub fn rewind(&mut self) {
        self.index = 0;
        self.spent = 0;
    }

    pub fn channel_count(&self) -> usize {
        self.groups.iter().map(|g| g.channels.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHost;
    use crate::error::TrapError;
    use crate::queue::{LinkedQueue, QueueType};
    use crate::scheduler::Task;
    use std::sync::Weak;
    use trap_core::DEFAULT_CHUNK_SIZE;
    use trap_transport::TransportHandle;

    struct QuietHost;

    impl ChannelHost for QuietHost {
        fn max_chunk_size(&self) -> usize {
            DEFAULT_CHUNK_SIZE
        }
        fn kick_sending(&self) {}
        fn schedule_changed(&self) {}
        fn deliver(&self, _message: Message, _transport: Option<TransportHandle>) {}
        fn receive_failed(&self, _channel: u8, _error: TrapError) {}
        fn send_abandoned(&self, _messages: Vec<Message>) {}
        fn spawn(&self, _task: Task) {}
    }

    fn channels(host: &Arc<QuietHost>, specs: &[(u8, i32)]) -> Vec<Arc<Channel>> {
        specs
            .iter()
            .map(|&(id, priority)| {
                let weak: Weak<dyn ChannelHost> = Arc::downgrade(host) as Weak<QuietHost>;
                let channel = Channel::new(id, weak, Box::new(LinkedQueue::new(QueueType::RegularMessage)));
                if id != 0 {
                    channel.set_priority(priority);
                }
                channel
            })
            .collect()
    }

    fn fill(channel: &Channel, count: usize) {
        for _ in 0..count {
            channel.send(Message::data(vec![channel.id(); 4])).unwrap();
        }
    }

    fn drain(scheduler: &mut ChannelScheduler) -> Vec<u8> {
        std::iter::from_fn(|| scheduler.pop()).map(|m| m.channel()).collect()
    }

    #[test]
    fn test_control_channel_first() {
        let host = Arc::new(QuietHost);
        let chans = channels(&host, &[(0, 0), (1, 0)]);
        fill(&chans[1], 2);
        fill(&chans[0], 1);

        let mut scheduler = ChannelScheduler::new();
        scheduler.rebuild(chans.iter().cloned());
        assert_eq!(drain(&mut scheduler), vec![0, 1, 1]);
    }

    #[test]
    fn test_round_robin_within_group() {
        let host = Arc::new(QuietHost);
        let chans = channels(&host, &[(1, 5), (2, 5), (3, 5)]);
        for channel in &chans {
            fill(channel, 2);
        }

        let mut scheduler = ChannelScheduler::new();
        scheduler.rebuild(chans.iter().cloned());
        assert!(scheduler.has_pending());
        assert_eq!(drain(&mut scheduler), vec![1, 2, 3, 1, 2, 3]);
        assert!(!scheduler.has_pending());
    }

    #[test]
    fn test_budget_moves_to_lower_group() {
        let host = Arc::new(QuietHost);
        // Each message costs 20 bytes; group 1 may spend 30 per turn
        let chans = channels(&host, &[(1, 30), (2, 10)]);
        fill(&chans[0], 4);
        fill(&chans[1], 1);

        let mut scheduler = ChannelScheduler::new();
        scheduler.rebuild(chans.iter().cloned());

        let first_pass = drain(&mut scheduler);
        assert_eq!(first_pass, vec![1, 1, 2]);

        scheduler.rewind();
        assert_eq!(drain(&mut scheduler), vec![1, 1]);
    }

    #[test]
    fn test_last_group_keeps_sending() {
        let host = Arc::new(QuietHost);
        let chans = channels(&host, &[(1, 1)]);
        fill(&chans[0], 3);

        let mut scheduler = ChannelScheduler::new();
        scheduler.rebuild(chans.iter().cloned());
        assert_eq!(drain(&mut scheduler), vec![1, 1, 1]);
        assert_eq!(scheduler.channel_count(), 1);
    }
}
