//! Decide which watched expressions a message triggers.
//!
//! Pure and synchronous: callers fetch a watch-set snapshot, run one pass,
//! and handle delivery themselves.

use super::expression::Expression;
use super::fold::{fold, tokens};
use super::watch_set::{SubscriberId, WatchSet};
use std::collections::{HashMap, HashSet};

/// Subscriber → expressions that fired for them.
pub type Triggered = HashMap<SubscriberId, HashSet<Expression>>;

/// A message folded once and reused across every expression test.
pub struct FoldedMessage {
    folded: String,
}

impl FoldedMessage {
    pub fn new(text: &str) -> Self {
        Self { folded: fold(text) }
    }

    /// Whether `expression` fires on this message.
    pub fn triggers(&self, expression: &Expression) -> bool {
        match expression {
            Expression::ExactMatch(text) => {
                let needle = fold(text);
                contains_run(&tokens(&self.folded), &tokens(&needle))
            }
            Expression::Contains(text) => self.folded.contains(&fold(text)),
        }
    }
}

/// Whether `expression` fires on `message`.
pub fn triggers(expression: &Expression, message: &str) -> bool {
    FoldedMessage::new(message).triggers(expression)
}

/// Every triggered (subscriber, expression) pair for `message`.
///
/// The author is *not* excluded here; see [`exclude_author`].
pub fn find_triggered_expressions(message: &str, watch_set: &WatchSet) -> Triggered {
    let folded = FoldedMessage::new(message);
    let mut triggered = Triggered::new();
    for (expression, subscribers) in watch_set.iter() {
        if !folded.triggers(expression) {
            continue;
        }
        for subscriber in subscribers {
            triggered
                .entry(subscriber.clone())
                .or_default()
                .insert(expression.clone());
        }
    }
    triggered
}

/// Drop the message author from a match result. Nobody is pinged for their own message.
pub fn exclude_author(mut triggered: Triggered, author: &str) -> Triggered {
    triggered.remove(author);
    triggered
}

/// Whether `needle` occurs as a contiguous run inside `haystack`.
///
/// An empty needle never matches.
fn contains_run(haystack: &[&str], needle: &[&str]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}
