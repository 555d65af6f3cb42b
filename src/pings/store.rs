//! Watch-set persistence: one JSON blob holding every expression.

use super::expression::Expression;
use super::watch_set::WatchSet;
use crate::blob::BlobStore;
use color_eyre::eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Blob key of the watch-set.
pub const WATCH_SET_KEY: &str = "autoPingsRepo.json";

/// Per-pair outcome of a batch insert/remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Expressions whose state changed.
    pub changed: Vec<Expression>,
    /// Expressions that were already in the requested state.
    pub unchanged: Vec<Expression>,
}

/// An insert that would take a subscriber past their cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapExceeded {
    pub current: usize,
    pub adding: usize,
    pub limit: usize,
}

/// Read-modify-write access to the persisted watch-set.
///
/// Writes from this process are serialized; other processes may still race,
/// which the handoff coordinator keeps to a short window.
pub struct PingsStore {
    blobs: Arc<dyn BlobStore>,
    write_lock: Mutex<()>,
}

impl PingsStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            write_lock: Mutex::new(()),
        }
    }

    /// Fetch a snapshot. A missing blob is an empty watch-set.
    pub async fn get_all(&self) -> Result<WatchSet> {
        let Some(bytes) = self
            .blobs
            .get(WATCH_SET_KEY)
            .await
            .wrap_err("failed to fetch watch-set")?
        else {
            tracing::debug!(key = WATCH_SET_KEY, "no watch-set stored yet");
            return Ok(WatchSet::new());
        };
        if bytes.is_empty() {
            return Ok(WatchSet::new());
        }
        WatchSet::from_json(&bytes).wrap_err("failed to decode watch-set")
    }

    /// Expressions `user_id` watches, sorted.
    pub async fn get(&self, user_id: &str) -> Result<Vec<Expression>> {
        Ok(self.get_all().await?.expressions_for(user_id))
    }

    /// Add `expressions` for `user_id` unless that would leave them with
    /// more than `limit`. A rejected batch adds nothing.
    pub async fn insert(
        &self,
        expressions: &[Expression],
        user_id: &str,
        limit: usize,
    ) -> Result<std::result::Result<BatchOutcome, CapExceeded>> {
        self.modify_checked(|set| {
            let current = set.count_for(user_id);
            let adding = expressions
                .iter()
                .filter(|e| !set.contains(e, user_id))
                .count();
            if current + adding > limit {
                return Err(CapExceeded {
                    current,
                    adding,
                    limit,
                });
            }
            let outcome = partition(expressions, |e| set.insert(e.clone(), user_id));
            let changed = !outcome.changed.is_empty();
            Ok((outcome, changed))
        })
        .await
    }

    pub async fn remove(&self, expressions: &[Expression], user_id: &str) -> Result<BatchOutcome> {
        self.modify(|set| partition(expressions, |e| set.remove(e, user_id)))
            .await
    }

    /// Apply `apply` to the current watch-set and persist it if anything changed.
    ///
    /// `apply` may reject the batch by returning an error; nothing is written then.
    async fn modify_checked<T, E>(
        &self,
        apply: impl FnOnce(&mut WatchSet) -> std::result::Result<(T, bool), E>,
    ) -> Result<std::result::Result<T, E>> {
        let _guard = self.write_lock.lock().await;
        let mut set = self.get_all().await?;
        match apply(&mut set) {
            Ok((value, changed)) => {
                if changed {
                    self.save(&set).await?;
                }
                Ok(Ok(value))
            }
            Err(e) => Ok(Err(e)),
        }
    }

    async fn modify(&self, apply: impl FnOnce(&mut WatchSet) -> BatchOutcome) -> Result<BatchOutcome> {
        let outcome = self
            .modify_checked::<_, std::convert::Infallible>(|set| {
                let outcome = apply(set);
                let changed = !outcome.changed.is_empty();
                Ok((outcome, changed))
            })
            .await?;
        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(never) => match never {},
        }
    }

    async fn save(&self, set: &WatchSet) -> Result<()> {
        let bytes = set.to_json().wrap_err("failed to encode watch-set")?;
        self.blobs
            .put(WATCH_SET_KEY, bytes)
            .await
            .wrap_err("failed to store watch-set")
    }
}

fn partition(expressions: &[Expression], mut apply: impl FnMut(&Expression) -> bool) -> BatchOutcome {
    let mut outcome = BatchOutcome {
        changed: Vec::new(),
        unchanged: Vec::new(),
    };
    for expression in expressions {
        if apply(expression) {
            outcome.changed.push(expression.clone());
        } else {
            outcome.unchanged.push(expression.clone());
        }
    }
    outcome
}
