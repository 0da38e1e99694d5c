//! Manage stored records: which publishers announced which keys, and until when.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::common::{Id, Node};

/// Maximum number of publishers remembered per key, the oldest is dropped first.
pub const MAX_PUBLISHERS_PER_KEY: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub publisher: Node,
    pub stored_at: Instant,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct RecordStore {
    expire: Duration,
    republish: Duration,
    /// Records per key, freshest first.
    records: HashMap<Id, Vec<Record>>,
    /// Keys this node is the original publisher of, and when it last published them.
    originals: HashMap<Id, Instant>,
}

impl RecordStore {
    pub fn new(expire: Duration, republish: Duration) -> Self {
        Self {
            expire,
            republish,
            records: HashMap::new(),
            originals: HashMap::new(),
        }
    }

    // === Getters ===

    /// Number of stored records over all keys.
    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every key with at least one record.
    pub fn keys(&self) -> Vec<Id> {
        self.records.keys().copied().collect()
    }

    // === Public Methods ===

    /// Store a publisher for a key, or reset the expiry of an existing record from the same publisher.
    pub fn insert(&mut self, key: Id, publisher: Node) {
        self.insert_at(key, publisher, Instant::now())
    }

    pub fn insert_at(&mut self, key: Id, publisher: Node, now: Instant) {
        let records = self.records.entry(key).or_default();

        records.retain(|record| record.publisher.id != publisher.id);
        records.insert(
            0,
            Record {
                publisher,
                stored_at: now,
                expires_at: now + self.expire,
            },
        );
        records.truncate(MAX_PUBLISHERS_PER_KEY);
    }

    /// Store a record this node is the original publisher of, so it gets republished.
    pub fn publish_at(&mut self, key: Id, publisher: Node, now: Instant) {
        self.insert_at(key, publisher, now);
        self.originals.insert(key, now);
    }

    /// Publishers of a key, most recently stored first.
    ///
    /// Returns an empty list for an unknown key.
    pub fn get(&self, key: &Id) -> Vec<Node> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &Id, now: Instant) -> Vec<Node> {
        self.records
            .get(key)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| record.expires_at > now)
                    .map(|record| record.publisher.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Records of a key, most recently stored first, expired or not.
    pub fn records(&self, key: &Id) -> &[Record] {
        self.records.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Remove every record whose expiry is at or before `now`, returns how many were removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.len();

        self.records.retain(|_, records| {
            records.retain(|record| record.expires_at > now);
            !records.is_empty()
        });

        before - self.len()
    }

    /// Keys this node originally published, that were last published at least `republish` ago.
    pub fn due_for_republish(&self, now: Instant) -> Vec<Id> {
        self.originals
            .iter()
            .filter(|(_, published_at)| {
                now.saturating_duration_since(**published_at) >= self.republish
            })
            .map(|(key, _)| *key)
            .collect()
    }

    /// Returns `true` if this node is the original publisher of `key`.
    pub fn is_original(&self, key: &Id) -> bool {
        self.originals.contains_key(key)
    }
}
