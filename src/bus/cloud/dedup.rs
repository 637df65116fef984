//! Duplicate suppression for queue pollers.

use std::collections::{HashSet, VecDeque};

use sha2::{Digest, Sha256};

use super::facade::QueueMessage;

/// Content fingerprint of a received message.
///
/// Covers the provider id and the body, so a redelivery of the same message
/// matches while distinct messages with equal bodies do not.
pub fn fingerprint(message: &QueueMessage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message.id.as_bytes());
    hasher.update(b"\n");
    hasher.update(message.body.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fixed-capacity, insertion-ordered set of recently seen fingerprints.
///
/// Inserting past capacity evicts the oldest entry. Re-inserting a present
/// entry does not refresh its position.
#[derive(Debug)]
pub struct RecentMessages {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl RecentMessages {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    /// Record a fingerprint. Returns `false` if it was already present.
    pub fn insert(&mut self, fingerprint: String) -> bool {
        if self.members.contains(&fingerprint) {
            return false;
        }
        if self.capacity == 0 {
            return true;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(fingerprint.clone());
        self.order.push_back(fingerprint);
        true
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.members.contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
