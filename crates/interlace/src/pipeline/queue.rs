// Delivery Queue
//
// Bounded FIFO of completed records awaiting delivery. Every item carries a
// monotonically increasing sequence number so a flush can deliver exactly
// what was queued when it started.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use interlace_core::{Event, Interaction, Signal, UserIdentity};

/// A completed record waiting for delivery
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    Interaction(Interaction),
    /// Standalone event: late, detached, or manually tracked outside a tree
    Event(Event),
    Signal(Signal),
    Identify(UserIdentity),
}

impl QueueItem {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueItem::Interaction(_) => "interaction",
            QueueItem::Event(_) => "event",
            QueueItem::Signal(_) => "signal",
            QueueItem::Identify(_) => "identify",
        }
    }

    /// Id of the record (user id for identify calls)
    pub fn id(&self) -> &str {
        match self {
            QueueItem::Interaction(i) => &i.id,
            QueueItem::Event(e) => &e.id,
            QueueItem::Signal(s) => &s.id,
            QueueItem::Identify(u) => &u.user_id,
        }
    }
}

/// Wire payload of one delivery
///
/// Each array keeps enqueue order; empty arrays are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interactions: Vec<Interaction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<Signal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserIdentity>,
}

impl Batch {
    pub fn from_items(items: Vec<QueueItem>) -> Self {
        let mut batch = Batch::default();
        for item in items {
            match item {
                QueueItem::Interaction(i) => batch.interactions.push(i),
                QueueItem::Event(e) => batch.events.push(e),
                QueueItem::Signal(s) => batch.signals.push(s),
                QueueItem::Identify(u) => batch.users.push(u),
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.interactions.len() + self.events.len() + self.signals.len() + self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded queue with oldest-first eviction
#[derive(Debug)]
pub struct DeliveryQueue {
    items: VecDeque<(u64, QueueItem)>,
    capacity: usize,
    next_seq: u64,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence number of the most recently pushed item
    pub fn high_water_mark(&self) -> u64 {
        self.next_seq
    }

    /// Append an item, returning the evicted oldest item when full
    pub fn push(&mut self, item: QueueItem) -> Option<QueueItem> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front().map(|(_, item)| item)
        } else {
            None
        };

        self.next_seq += 1;
        self.items.push_back((self.next_seq, item));
        evicted
    }

    /// Take up to `max` of the oldest items pushed at or before `mark`
    pub fn drain_through(&mut self, mark: u64, max: usize) -> Vec<QueueItem> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.items.front() {
                Some((seq, _)) if *seq <= mark => {
                    if let Some((_, item)) = self.items.pop_front() {
                        out.push(item);
                    }
                }
                _ => break,
            }
        }
        out
    }
}
