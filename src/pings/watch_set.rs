//! The full mapping of watched expressions to their subscribers.

use super::expression::Expression;
use super::fold::fold;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Subscriber identifier (a Discord user snowflake, kept as its decimal string).
pub type SubscriberId = String;

/// Expression → subscribers. No expression ever maps to an empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSet {
    items: HashMap<Expression, HashSet<SubscriberId>>,
}

/// On-disk container: `{"items": {"T-vapor": ["123", ...], ...}}`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedWatchSet {
    #[serde(default)]
    items: BTreeMap<String, Vec<SubscriberId>>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `subscriber` to `expression`. Returns `false` if the pair already existed.
    pub fn insert(&mut self, expression: Expression, subscriber: &str) -> bool {
        self.items
            .entry(expression)
            .or_default()
            .insert(subscriber.to_owned())
    }

    /// Remove `subscriber` from `expression`. Returns `false` if the pair was absent.
    pub fn remove(&mut self, expression: &Expression, subscriber: &str) -> bool {
        let Some(subscribers) = self.items.get_mut(expression) else {
            return false;
        };
        let removed = subscribers.remove(subscriber);
        if subscribers.is_empty() {
            self.items.remove(expression);
        }
        removed
    }

    pub fn contains(&self, expression: &Expression, subscriber: &str) -> bool {
        self.items
            .get(expression)
            .is_some_and(|subscribers| subscribers.contains(subscriber))
    }

    pub fn subscribers(&self, expression: &Expression) -> Option<&HashSet<SubscriberId>> {
        self.items.get(expression)
    }

    /// All expressions `subscriber` watches, sorted for display.
    pub fn expressions_for(&self, subscriber: &str) -> Vec<Expression> {
        let mut expressions: Vec<Expression> = self
            .items
            .iter()
            .filter(|(_, subscribers)| subscribers.contains(subscriber))
            .map(|(expression, _)| expression.clone())
            .collect();
        expressions.sort();
        expressions
    }

    pub fn count_for(&self, subscriber: &str) -> usize {
        self.items
            .values()
            .filter(|subscribers| subscribers.contains(subscriber))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Expression, &HashSet<SubscriberId>)> {
        self.items.iter()
    }

    /// Number of distinct expressions.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Decode the persisted JSON form.
    ///
    /// Entries with an unknown discriminator, no subscribers, or text that
    /// folds to nothing are dropped and logged; a body that is not the container shape at all is an error.
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        let persisted: PersistedWatchSet = serde_json::from_slice(bytes)?;
        let mut set = Self::new();
        for (raw, subscribers) in persisted.items {
            let expression = match Expression::decode(&raw) {
                Ok(expression) => expression,
                Err(e) => {
                    tracing::error!(error = %e, "skipping unreadable watch-set entry");
                    continue;
                }
            };
            if fold(expression.inner()).trim().is_empty() {
                tracing::error!(entry = %raw, "skipping watch-set entry with empty text");
                continue;
            }
            for subscriber in subscribers {
                set.insert(expression.clone(), &subscriber);
            }
        }
        Ok(set)
    }

    /// Encode to the persisted JSON form, with keys and subscribers sorted.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let items = self
            .items
            .iter()
            .map(|(expression, subscribers)| {
                let mut subscribers: Vec<SubscriberId> = subscribers.iter().cloned().collect();
                subscribers.sort();
                (expression.encode(), subscribers)
            })
            .collect();
        serde_json::to_vec_pretty(&PersistedWatchSet { items })
    }
}

impl FromIterator<(Expression, SubscriberId)> for WatchSet {
    fn from_iter<I: IntoIterator<Item = (Expression, SubscriberId)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (expression, subscriber) in iter {
            set.insert(expression, &subscriber);
        }
        set
    }
}
