//! Local echoes waiting for their server event.

use std::{collections::VecDeque, time::Duration};

use harmony_core::{ChatMessage, EchoKey};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct PendingEcho {
    txn_id: String,
    key: EchoKey,
    sent_at: Instant,
}

/// Pending echoes of one chat view, oldest first.
#[derive(Debug)]
pub struct PendingEchoes {
    ttl: Duration,
    entries: VecDeque<PendingEcho>,
}

impl PendingEchoes {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, txn_id: String, key: EchoKey) {
        self.entries.push_back(PendingEcho {
            txn_id,
            key,
            sent_at: Instant::now(),
        });
    }

    /// Drop echoes older than the TTL.
    pub fn prune(&mut self) {
        let now = Instant::now();
        while self
            .entries
            .front()
            .is_some_and(|e| now.duration_since(e.sent_at) > self.ttl)
        {
            self.entries.pop_front();
        }
    }

    /// Remove and return the transaction id of the echo `message` confirms.
    ///
    /// The transaction id round-tripped by the server is tried first; events
    /// without one (sent from an older server or another path) fall back to
    /// (sender, room, html), oldest echo first.
    pub fn take_match(&mut self, message: &ChatMessage) -> Option<String> {
        self.prune();
        let index = message
            .transaction_id
            .as_deref()
            .and_then(|txn| self.entries.iter().position(|e| e.txn_id == txn))
            .or_else(|| {
                let key = message.echo_key();
                self.entries.iter().position(|e| e.key == key)
            })?;
        self.entries.remove(index).map(|e| e.txn_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
