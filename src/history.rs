//! # Message Log and History Merge
//!
//! Each peer keeps an append-only [`MessageLog`]: accepted messages in
//! acceptance order, plus the set of ids already stored. The two live behind
//! one lock in the peer, so "check id, then append" is a single step and two
//! gossip paths delivering the same message cannot both store it.
//!
//! ## Local Dedup vs. Gossip Ledger
//!
//! | Structure | Owner | Gates |
//! |-----------|-------|-------|
//! | `MessageLog::known` | peer | storage in the local log |
//! | gossip ledger | directory | delivery and re-gossip |
//!
//! ## History Merge
//!
//! A history request picks neighbors with [`select_candidates`], pulls a tail
//! slice of each neighbor's log with [`MessageLog::recent`], and sorts the
//! aggregate with [`sort_by_timestamp`]. The sort is stable, so messages with
//! equal timestamps keep the order in which they were pulled.

use std::collections::HashSet;

use crate::identity::PeerId;
use crate::messages::{Message, MessageId};

#[derive(Debug, Default)]
pub(crate) struct MessageLog {
    known: HashSet<MessageId>,
    entries: Vec<Message>,
}

impl MessageLog {
    /// Append `message` unless its id is already stored.
    ///
    /// Returns `true` if the message was appended.
    pub fn append(&mut self, message: Message) -> bool {
        if !self.known.insert(message.id()) {
            return false;
        }
        self.entries.push(message);
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.known.contains(id)
    }

    /// Up to `limit` of the most recently appended entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Message> {
        let from = self.entries.len().saturating_sub(limit);
        self.entries[from..].to_vec()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Build the neighbor list for a history request.
///
/// Connected peers come first, then the random sample. `local` and repeats
/// are dropped and the result is capped at `limit`.
pub(crate) fn select_candidates(
    local: &PeerId,
    connected: impl IntoIterator<Item = PeerId>,
    sampled: impl IntoIterator<Item = PeerId>,
    limit: usize,
) -> Vec<PeerId> {
    let mut seen = HashSet::new();
    connected
        .into_iter()
        .chain(sampled)
        .filter(|id| id != local)
        .filter(|id| seen.insert(id.clone()))
        .take(limit)
        .collect()
}

/// Stable ascending sort on timestamp.
pub(crate) fn sort_by_timestamp(messages: &mut [Message]) {
    messages.sort_by_key(Message::timestamp);
}
