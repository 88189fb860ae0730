//! Time-ordered expiry queue.
//!
//! Holds raw `"<millis>-<fromId>"` tokens in a min-heap ordered by the
//! numeric millis prefix, then by the raw token. Tokens without a numeric
//! prefix sort first. Full parsing is deferred to pop time so that malformed
//! tokens are discarded there, never on the write path.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use idmap_core::{ExpiryToken, TokenError};
use parking_lot::Mutex;

/// Result of one [`ExpiryQueue::pop_due`] step.
#[derive(Debug, PartialEq, Eq)]
pub enum PopOutcome {
    /// The smallest token was due and has been removed.
    Due(ExpiryToken),
    /// The smallest token could not be parsed and has been removed.
    Malformed(TokenError),
    /// The smallest token is newer than the cutoff; nothing was removed.
    NotDue,
    /// The queue is empty.
    Empty,
}

/// Heap order of a raw token: `(millis prefix or 0, token)`.
type QueueKey = (u64, String);

fn queue_key(raw: String) -> QueueKey {
    let millis = raw
        .split_once('-')
        .and_then(|(millis, _)| millis.parse().ok())
        .unwrap_or(0);
    (millis, raw)
}

/// Min-heap of expiry tokens.
#[derive(Debug, Default)]
pub struct ExpiryQueue {
    heap: Mutex<BinaryHeap<Reverse<QueueKey>>>,
}

impl ExpiryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `from_id` entered the hot cache at `inserted_at`.
    pub fn record_insertion(&self, from_id: &str, inserted_at: u64) {
        self.push_token(ExpiryToken::new(inserted_at, from_id).to_string());
    }

    /// Pushes a raw token as-is.
    pub fn push_token(&self, token: String) {
        self.heap.lock().push(Reverse(queue_key(token)));
    }

    /// Peeks the smallest token and pops it if it is malformed or due.
    ///
    /// Peek and pop happen under one lock acquisition, so a concurrent
    /// insertion can never be popped in place of the peeked token.
    pub fn pop_due(&self, cutoff: u64) -> PopOutcome {
        let mut heap = self.heap.lock();
        let Some(Reverse((_, raw))) = heap.peek() else {
            return PopOutcome::Empty;
        };
        match ExpiryToken::parse(raw) {
            Ok(token) if token.inserted_at > cutoff => PopOutcome::NotDue,
            Ok(token) => {
                heap.pop();
                PopOutcome::Due(token)
            }
            Err(err) => {
                heap.pop();
                PopOutcome::Malformed(err)
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}
