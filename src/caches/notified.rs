//! Which subscribers were already pinged for which message.
//!
//! Lets a message edit ping only for newly matching expressions. Bounded to
//! `capacity` messages with FIFO eviction.

use crate::pings::{Expression, SubscriberId, Triggered};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Default number of messages remembered.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug)]
pub struct NotifiedCache {
    capacity: usize,
    entries: HashMap<u64, Triggered>,
    /// Insertion order of `entries`, oldest first.
    order: VecDeque<u64>,
}

/// Serialized form, oldest message first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifiedSnapshot {
    #[serde(default)]
    pub entries: Vec<NotifiedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifiedEntry {
    pub message_id: u64,
    pub pings: BTreeMap<SubscriberId, Vec<Expression>>,
}

impl NotifiedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record `triggered` for `message_id` and return only the pairs not
    /// recorded before.
    pub fn record_new(&mut self, message_id: u64, triggered: Triggered) -> Triggered {
        if !self.entries.contains_key(&message_id) {
            self.make_room();
            self.order.push_back(message_id);
        }
        let seen = self.entries.entry(message_id).or_default();

        let mut fresh = Triggered::new();
        for (subscriber, expressions) in triggered {
            let seen_for = seen.entry(subscriber.clone()).or_default();
            let new: HashSet<Expression> = expressions
                .into_iter()
                .filter(|e| seen_for.insert(e.clone()))
                .collect();
            if !new.is_empty() {
                fresh.insert(subscriber, new);
            }
        }
        fresh
    }

    pub fn snapshot(&self) -> NotifiedSnapshot {
        let entries = self
            .order
            .iter()
            .filter_map(|id| {
                let pings = self.entries.get(id)?;
                let pings = pings
                    .iter()
                    .map(|(subscriber, expressions)| {
                        let mut expressions: Vec<Expression> = expressions.iter().cloned().collect();
                        expressions.sort();
                        (subscriber.clone(), expressions)
                    })
                    .collect();
                Some(NotifiedEntry {
                    message_id: *id,
                    pings,
                })
            })
            .collect();
        NotifiedSnapshot { entries }
    }

    /// Merge a snapshot into this cache, oldest entries first.
    pub fn restore(&mut self, snapshot: NotifiedSnapshot) {
        for entry in snapshot.entries {
            let triggered: Triggered = entry
                .pings
                .into_iter()
                .map(|(subscriber, expressions)| (subscriber, expressions.into_iter().collect()))
                .collect();
            self.record_new(entry.message_id, triggered);
        }
    }

    fn make_room(&mut self) {
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

impl Default for NotifiedCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
