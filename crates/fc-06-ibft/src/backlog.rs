//! Per-source backlog of future-view messages.
//!
//! Priority packs `(sequence, round, code)` into one integer so the queue
//! drains oldest-view first, and within a view PREPREPARE before COMMIT
//! before PREPARE. Round changes rank on sequence alone.

use crate::message::{Message, MsgCode};
use shared_types::Address;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Upper bound on queued messages per validator.
pub const MAX_BACKLOG_PER_VALIDATOR: usize = 128;

fn code_priority(code: MsgCode) -> u64 {
    match code {
        MsgCode::Preprepare => 1,
        MsgCode::Commit => 2,
        MsgCode::Prepare => 3,
        MsgCode::RoundChange => 0,
    }
}

/// Smaller = drained earlier.
fn priority(message: &Message) -> u64 {
    let view = message.view();
    match message.code {
        MsgCode::RoundChange => view.sequence * 1000,
        code => view.sequence * 1000 + view.round * 10 + code_priority(code),
    }
}

#[derive(Debug)]
struct Entry {
    key: u64,
    message: Message,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// Future messages, one bounded priority queue per source validator.
#[derive(Debug, Default)]
pub struct Backlog {
    queues: HashMap<Address, BinaryHeap<Reverse<Entry>>>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a future message; silently drops when the source's queue is at
    /// capacity.
    pub fn store(&mut self, source: Address, message: Message) {
        let queue = self.queues.entry(source).or_default();
        if queue.len() >= MAX_BACKLOG_PER_VALIDATOR {
            return;
        }
        queue.push(Reverse(Entry {
            key: priority(&message),
            message,
        }));
    }

    /// Pop the front message of `source`'s queue.
    pub fn pop(&mut self, source: &Address) -> Option<Message> {
        let queue = self.queues.get_mut(source)?;
        let entry = queue.pop()?;
        if queue.is_empty() {
            self.queues.remove(source);
        }
        Some(entry.0.message)
    }

    /// Push a message back to the front of its queue (it was still future).
    pub fn push_back(&mut self, source: Address, message: Message) {
        self.store(source, message);
    }

    pub fn sources(&self) -> Vec<Address> {
        self.queues.keys().copied().collect()
    }

    /// Drop a source's entire queue (validator left the set).
    pub fn remove_source(&mut self, source: &Address) {
        self.queues.remove(source);
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(BinaryHeap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
