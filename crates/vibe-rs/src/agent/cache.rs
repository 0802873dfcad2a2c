//! Reply cache keyed by a fingerprint of the context sent to the backend.
//!
//! Two turns that send the same messages with the same model settings get
//! the same reply without a second backend call. Entries are evicted
//! oldest-first once the capacity is reached; a capacity of 0 disables the
//! cache.

use super::backend::CompletionSettings;
use crate::Message;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub const DEFAULT_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Entries {
    replies: HashMap<String, String>,
    order: VecDeque<String>,
}

/// Bounded, thread-safe map from context fingerprint to reply.
#[derive(Debug)]
pub struct ReplyCache {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl Default for ReplyCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl ReplyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Entries::default()),
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hex SHA-256 over the role and content of each message plus the model
    /// settings. Timestamps and metadata do not take part.
    pub fn key(messages: &[Message], settings: &CompletionSettings) -> String {
        let mut hasher = Sha256::new();
        // Strings are length-prefixed so adjacent fields cannot run together.
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        field(settings.model.as_bytes());
        field(&settings.temperature.to_le_bytes());
        field(&settings.max_tokens.to_le_bytes());
        for message in messages {
            field(message.role().as_str().as_bytes());
            field(message.content().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        self.entries().replies.get(key).cloned()
    }

    pub fn insert(&self, key: String, reply: String) {
        if !self.is_enabled() {
            return;
        }
        let mut entries = self.entries();
        if entries.replies.insert(key.clone(), reply).is_none() {
            entries.order.push_back(key);
        }
        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.replies.remove(&oldest);
                debug!("Evicted cached reply {oldest}");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries().replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut entries = self.entries();
        entries.replies.clear();
        entries.order.clear();
    }
}
