//! Per-destination FIFO queues of undelivered messages.

use crate::command::{Command, HopTrail, SendMsg};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};

/// A message waiting in a destination queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub to: String,
    pub from: String,
    pub content: String,
    pub hops: HopTrail,
    pub hop_count: usize,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(msg: SendMsg) -> Self {
        Self {
            hop_count: msg.hops.count(),
            to: msg.to,
            from: msg.from,
            content: msg.content,
            hops: msg.hops,
            enqueued_at: Utc::now(),
        }
    }

    /// The SENDMSG that hands this message to whoever picks it up.
    pub fn into_sendmsg(self) -> Command {
        Command::SendMsg(SendMsg {
            to: self.to,
            from: self.from,
            content: self.content,
            hops: self.hops,
        })
    }
}

/// All destination queues. Each message lives in exactly one queue and is
/// removed exactly once by [`MessageStore::pop`].
#[derive(Debug, Default)]
pub struct MessageStore {
    queues: BTreeMap<String, VecDeque<QueuedMessage>>,
}

impl MessageStore {
    pub fn push(&mut self, message: QueuedMessage) {
        self.queues
            .entry(message.to.clone())
            .or_default()
            .push_back(message);
    }

    pub fn pop(&mut self, group_id: &str) -> Option<QueuedMessage> {
        let queue = self.queues.get_mut(group_id)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(group_id);
        }
        message
    }

    pub fn len(&self, group_id: &str) -> usize {
        self.queues.get(group_id).map(VecDeque::len).unwrap_or(0)
    }

    /// `(group, depth)` for every non-empty queue, ordered by group id.
    pub fn summary(&self) -> Vec<(String, usize)> {
        self.queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(group, q)| (group.clone(), q.len()))
            .collect()
    }

    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}
